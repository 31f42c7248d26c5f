//! Observability configuration
//!
//! A TOML file describes the service's logger, tracer, request scoping and
//! static fields/attributes. A handful of conventional environment variables
//! override file values after loading.
//!
//! ```toml
//! service_name = "checkout"
//!
//! [logging]
//! level = "debug"
//! format = "pretty"
//!
//! [tracing]
//! exporter = "otlp-http"
//! endpoint = "http://collector:4318"
//!
//! [tracing.resource]
//! "deployment.environment" = "prod"
//!
//! [requests]
//! request_id = true
//! timestamp = true
//!
//! [fields]
//! region = "eu-west-1"
//! ```

use crate::fields::Field;
use crate::tracer::{Attributes, ExporterKind, TracerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Top-level observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Service name reported on spans and used as tracer name
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Tracing is disabled when the section is absent
    pub tracing: Option<TracingConfig>,
    #[serde(default)]
    pub requests: RequestsConfig,
    /// Static log fields attached at composition time
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Static span attributes attached at composition time
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_service_name() -> String {
    "unknown_service".to_string()
}

/// Process log subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// ERROR, WARN, INFO, DEBUG or TRACE
    #[serde(default = "default_log_level")]
    pub level: String,
    /// json, pretty or compact
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Emit span open/close events
    #[serde(default)]
    pub include_spans: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_spans: false,
        }
    }
}

/// `[tracing]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TracingConfig {
    #[serde(default)]
    pub exporter: ExporterKind,
    /// Collector base URL; the OTLP exporter adds `/v1/traces`
    pub endpoint: Option<String>,
    #[serde(default)]
    pub register_global: bool,
    #[serde(default)]
    pub resource: BTreeMap<String, String>,
}

/// Per-request scoping defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestsConfig {
    /// Attach a generated `req_id` field
    #[serde(default = "default_true")]
    pub request_id: bool,
    /// Attach an `at` timestamp captured when the request starts
    #[serde(default)]
    pub timestamp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            request_id: true,
            timestamp: false,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            tracing: None,
            requests: RequestsConfig::default(),
            fields: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }
}

impl ObservabilityConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ObservabilityConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, then apply process environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "service_name must not be empty".to_string(),
            ));
        }

        if let Some(endpoint) = self.tracing.as_ref().and_then(|t| t.endpoint.as_deref()) {
            let url = url::Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidConfig(format!("Invalid tracing endpoint '{endpoint}': {e}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidConfig(format!(
                    "Tracing endpoint '{endpoint}' must use http or https"
                )));
            }
        }

        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Recognised variables: `LOG_LEVEL`, `LOG_FORMAT`, `LOG_SPANS`,
    /// `OTEL_SERVICE_NAME` and `OTEL_EXPORTER_OTLP_ENDPOINT`. Setting the OTLP
    /// endpoint (a base URL, as the OpenTelemetry convention has it) enables
    /// tracing with the `otlp-http` exporter.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(spans) = lookup("LOG_SPANS") {
            self.logging.include_spans = spans.eq_ignore_ascii_case("true");
        }
        if let Some(name) = lookup("OTEL_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            let tracing = self.tracing.get_or_insert_with(TracingConfig::default);
            tracing.exporter = ExporterKind::OtlpHttp;
            tracing.endpoint = Some(endpoint);
        }
    }

    /// Tracer construction settings, when tracing is configured
    pub fn tracer_config(&self) -> Option<TracerConfig> {
        self.tracing.as_ref().map(|tracing| TracerConfig {
            service_name: self.service_name.clone(),
            exporter: tracing.exporter,
            endpoint: tracing.endpoint.clone(),
            resource: tracing.resource.clone(),
            register_global: tracing.register_global,
        })
    }

    pub fn static_fields(&self) -> Vec<Field> {
        self.fields
            .iter()
            .map(|(key, value)| Field::string(key.clone(), value.clone()))
            .collect()
    }

    pub fn static_attributes(&self) -> Attributes {
        self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
