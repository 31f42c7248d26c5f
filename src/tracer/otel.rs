//! OpenTelemetry tracer backend
//!
//! Builds an SDK tracer provider from a [`TracerConfig`] and adapts its tracer
//! to the [`Tracer`] capability. The provider is shut down by the teardown
//! action returned from [`with_tracer`], never implicitly.
//!
//! Exporters:
//! - `stdout`: simple (synchronous) span processor printing to stdout
//! - `otlp-http`: batch span processor over OTLP/HTTP protobuf; requires a
//!   running tokio runtime. On a current-thread runtime the batch worker gets
//!   its own thread so flushing never waits on the caller's thread.

use super::{noop_tracer, with_tracer_handle, Attributes, Span, SpanHandle, Tracer, TracerHandle};
use crate::context::Context;
use crate::error::{TelemetryError, TelemetryResult};
use crate::lifecycle::TeardownAction;
use crate::logger::report_failure;
use once_cell::sync::OnceCell;
use opentelemetry::trace::{TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Config, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::RuntimeFlavor;
use tracing::Level;

/// Span exporter selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExporterKind {
    #[default]
    Stdout,
    OtlpHttp,
}

impl ExporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExporterKind::Stdout => "stdout",
            ExporterKind::OtlpHttp => "otlp-http",
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to build a tracer provider
#[derive(Debug, Clone, PartialEq)]
pub struct TracerConfig {
    /// Service name; also the tracer's instrumentation name
    pub service_name: String,
    pub exporter: ExporterKind,
    /// Collector base URL for `otlp-http` (e.g. `http://collector:4318`); the
    /// exporter appends `/v1/traces`. The exporter default when unset.
    pub endpoint: Option<String>,
    /// Extra resource attributes merged over the SDK default resource
    pub resource: BTreeMap<String, String>,
    /// Also install the provider as the process-wide OpenTelemetry provider
    pub register_global: bool,
}

impl TracerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            exporter: ExporterKind::default(),
            endpoint: None,
            resource: BTreeMap::new(),
            register_global: false,
        }
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_resource_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.resource.insert(key.into(), value.into());
        self
    }

    pub fn with_global_registration(mut self) -> Self {
        self.register_global = true;
        self
    }

    pub(crate) fn resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new("service.name", self.service_name.clone())];
        attributes.extend(
            self.resource
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );
        Resource::default().merge(&Resource::new(attributes))
    }
}

const OTLP_TRACES_PATH: &str = "/v1/traces";

/// Strip the signal path the OTLP/HTTP exporter appends on its own, so both
/// `http://host:4318` and `http://host:4318/v1/traces` export to the same URL.
pub(crate) fn otlp_base_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    trimmed
        .strip_suffix(OTLP_TRACES_PATH)
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_string()
}

static GLOBAL_PROVIDER: OnceCell<()> = OnceCell::new();

/// Install `provider` as the global OpenTelemetry provider.
///
/// Only the first registration in the process takes effect. Returns whether
/// this call performed it.
pub fn register_global_provider(provider: &TracerProvider) -> bool {
    let mut installed = false;
    GLOBAL_PROVIDER.get_or_init(|| {
        let _previous = global::set_tracer_provider(provider.clone());
        installed = true;
    });
    installed
}

/// Owned SDK provider plus the tracer created from it
pub struct OtelProvider {
    provider: Mutex<Option<TracerProvider>>,
    tracer: opentelemetry_sdk::trace::Tracer,
    global: bool,
}

impl OtelProvider {
    pub fn build(config: &TracerConfig) -> TelemetryResult<Self> {
        let trace_config = Config::default().with_resource(config.resource());

        let provider = match config.exporter {
            ExporterKind::Stdout => TracerProvider::builder()
                .with_config(trace_config)
                .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
                .build(),
            ExporterKind::OtlpHttp => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return Err(TelemetryError::exporter_init(
                        "otlp-http export requires a running tokio runtime",
                    ));
                };

                let mut builder = opentelemetry_otlp::new_exporter().http();
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(otlp_base_endpoint(endpoint));
                }
                let exporter = builder.build_span_exporter()?;

                let builder = TracerProvider::builder().with_config(trace_config);
                // force_flush blocks the calling thread until the batch worker
                // answers, so the worker must not share a current-thread runtime
                match handle.runtime_flavor() {
                    RuntimeFlavor::CurrentThread => builder
                        .with_batch_exporter(exporter, runtime::TokioCurrentThread)
                        .build(),
                    _ => builder.with_batch_exporter(exporter, runtime::Tokio).build(),
                }
            }
        };

        let tracer = provider.tracer(config.service_name.clone());
        let global = config.register_global && register_global_provider(&provider);

        tracing::debug!(
            service = %config.service_name,
            exporter = %config.exporter,
            global,
            "Tracer provider constructed"
        );

        Ok(Self {
            provider: Mutex::new(Some(provider)),
            tracer,
            global,
        })
    }

    pub fn tracer(&self) -> TracerHandle {
        Arc::new(OtelTracer {
            tracer: self.tracer.clone(),
        })
    }

    /// Whether this provider is the process-wide one
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Flush pending spans and release the provider. Later calls do nothing.
    pub fn shutdown(&self) -> TelemetryResult<()> {
        let provider = self
            .provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(provider) = provider else {
            return Ok(());
        };

        let failures: Vec<String> = provider
            .force_flush()
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();

        // Dropping the last provider reference shuts its span processors down
        drop(provider);
        if self.global {
            global::shutdown_tracer_provider();
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::shutdown(failures.join("; ")))
        }
    }
}

/// [`Tracer`] backed by an OpenTelemetry SDK tracer
pub struct OtelTracer {
    tracer: opentelemetry_sdk::trace::Tracer,
}

impl Tracer for OtelTracer {
    fn start(&self, name: &str, parent: Option<&dyn Span>, attributes: &Attributes) -> SpanHandle {
        let parent_cx = parent
            .and_then(|p| p.as_any().downcast_ref::<OtelSpan>())
            .map(|p| p.cx.clone())
            .unwrap_or_default();

        let builder = self
            .tracer
            .span_builder(name.to_string())
            .with_attributes(key_values(attributes));
        let span = self.tracer.build_with_context(builder, &parent_cx);

        Arc::new(OtelSpan {
            cx: parent_cx.with_span(span),
        })
    }
}

/// Live OpenTelemetry span, held inside the OpenTelemetry context that
/// parents its children
pub struct OtelSpan {
    cx: opentelemetry::Context,
}

impl OtelSpan {
    /// Hex trace id, for log correlation
    pub fn trace_id(&self) -> String {
        self.cx.span().span_context().trace_id().to_string()
    }

    /// Hex span id
    pub fn span_id(&self) -> String {
        self.cx.span().span_context().span_id().to_string()
    }
}

impl Span for OtelSpan {
    fn set_attributes(&self, attributes: &Attributes) {
        self.cx.span().set_attributes(key_values(attributes));
    }

    fn end(&self) {
        self.cx.span().end();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.to_string(), v.to_string()))
        .collect()
}

/// Attach an OpenTelemetry tracer built from `config`.
///
/// Returns the derived context and a teardown action that flushes and shuts
/// the provider down. When construction fails the failure is reported through
/// the best-effort logger and the context carries the no-op tracer instead, so
/// spans started below it are inert even if an ancestor has a tracer.
pub fn with_tracer(ctx: &Context, config: &TracerConfig) -> (Context, Option<TeardownAction>) {
    match OtelProvider::build(config) {
        Ok(provider) => {
            let derived = with_tracer_handle(ctx, provider.tracer());
            let action = TeardownAction::new(format!("tracer:{}", config.service_name), move || {
                provider.shutdown()
            });
            (derived, Some(action))
        }
        Err(err) => {
            report_failure(
                ctx,
                Level::ERROR,
                "failed to construct tracer, spans are disabled",
                &err,
            );
            (with_tracer_handle(ctx, noop_tracer()), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::with_logger;
    use crate::testing::MemoryLogger;
    use crate::tracer::{current_span, start_span, tracer, with_attributes};
    use opentelemetry::Key;

    #[test]
    fn test_exporter_kind_names() {
        assert_eq!(ExporterKind::Stdout.to_string(), "stdout");
        assert_eq!(ExporterKind::OtlpHttp.to_string(), "otlp-http");

        let parsed: ExporterKind = serde_json::from_str("\"otlp-http\"").unwrap();
        assert_eq!(parsed, ExporterKind::OtlpHttp);
    }

    #[test]
    fn test_tracer_config_builder() {
        let config = TracerConfig::new("checkout")
            .with_exporter(ExporterKind::OtlpHttp)
            .with_endpoint("http://collector:4318")
            .with_resource_attribute("deployment.environment", "prod");

        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.exporter, ExporterKind::OtlpHttp);
        assert_eq!(
            config.endpoint.as_deref(),
            Some("http://collector:4318")
        );
        assert_eq!(
            config.resource.get("deployment.environment").map(String::as_str),
            Some("prod")
        );
        assert!(!config.register_global);
    }

    #[test]
    fn test_resource_carries_service_name_and_extras() {
        let resource = TracerConfig::new("checkout")
            .with_resource_attribute("team", "payments")
            .resource();

        assert_eq!(
            resource.get(Key::new("service.name")),
            Some(opentelemetry::Value::from("checkout"))
        );
        assert_eq!(
            resource.get(Key::new("team")),
            Some(opentelemetry::Value::from("payments"))
        );
    }

    #[test]
    fn test_otlp_without_runtime_degrades_to_noop() {
        let memory = MemoryLogger::new();
        let ctx = with_logger(&Context::background(), memory.handle());
        let config = TracerConfig::new("svc").with_exporter(ExporterKind::OtlpHttp);

        let (ctx, action) = with_tracer(&ctx, &config);

        assert!(action.is_none());
        assert!(tracer(&ctx).is_noop());
        let (_child, guard) = start_span(&ctx, "ignored", Attributes::new());
        assert!(!guard.is_recording());

        let record = memory.last().unwrap();
        assert_eq!(record.level, Level::ERROR);
        assert!(record.fields[0].value.to_string().contains("tokio runtime"));
    }

    #[test]
    fn test_stdout_tracer_parents_spans_and_shuts_down() {
        let (ctx, action) = with_tracer(&Context::background(), &TracerConfig::new("stdout-test"));
        let action = action.expect("stdout tracer should build");
        assert!(!tracer(&ctx).is_noop());

        let (outer_ctx, mut outer) = start_span(&ctx, "outer", Attributes::from([("step", "1")]));
        let (inner_ctx, mut inner) = start_span(&outer_ctx, "inner", Attributes::new());
        let _ = with_attributes(&inner_ctx, Attributes::from([("rows", "12")]));

        let outer_span = current_span(&outer_ctx).unwrap();
        let inner_span = current_span(&inner_ctx).unwrap();
        let outer_otel = outer_span.as_any().downcast_ref::<OtelSpan>().unwrap();
        let inner_otel = inner_span.as_any().downcast_ref::<OtelSpan>().unwrap();
        assert_eq!(outer_otel.trace_id(), inner_otel.trace_id());
        assert_ne!(outer_otel.span_id(), inner_otel.span_id());

        inner.end();
        outer.end();
        assert!(action.run().is_ok());
    }

    #[test]
    fn test_otlp_endpoint_is_a_base_url() {
        assert_eq!(
            otlp_base_endpoint("http://collector:4318"),
            "http://collector:4318"
        );
        assert_eq!(
            otlp_base_endpoint("http://collector:4318/"),
            "http://collector:4318"
        );
        assert_eq!(
            otlp_base_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318"
        );
        assert_eq!(
            otlp_base_endpoint("https://gateway.example/otel/v1/traces/"),
            "https://gateway.example/otel"
        );
    }

    #[test]
    fn test_otlp_teardown_returns_on_current_thread_runtime() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let outcome = runtime.block_on(async {
                let config = TracerConfig::new("current-thread")
                    .with_exporter(ExporterKind::OtlpHttp)
                    .with_endpoint("http://127.0.0.1:9");
                let (ctx, action) = with_tracer(&Context::background(), &config);
                let action = action.expect("otlp tracer should build inside a runtime");

                let (_child, mut guard) = start_span(&ctx, "work", Attributes::new());
                assert!(guard.is_recording());
                guard.end();

                // Nothing listens on the port; only the return matters
                action.run().is_ok()
            });
            let _ = done_tx.send(outcome);
        });

        let returned = done_rx.recv_timeout(std::time::Duration::from_secs(20));
        assert!(returned.is_ok(), "otlp teardown did not return");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let provider = OtelProvider::build(&TracerConfig::new("idempotent")).unwrap();
        assert!(provider.shutdown().is_ok());
        assert!(provider.shutdown().is_ok());
    }

    #[test]
    fn test_global_registration_happens_once() {
        let first = OtelProvider::build(&TracerConfig::new("global-a")).unwrap();
        let second = OtelProvider::build(&TracerConfig::new("global-b")).unwrap();

        let guard = first.provider.lock().unwrap();
        let installed = register_global_provider(guard.as_ref().unwrap());
        drop(guard);
        assert!(installed);

        let guard = second.provider.lock().unwrap();
        assert!(!register_global_provider(guard.as_ref().unwrap()));
    }
}
