//! Error types for context-carried observability
//!
//! Setup failures are never fatal to the caller: they are reported through the
//! best-effort logger and the affected capability degrades to a no-op. The only
//! error surfaced to callers directly is the combined teardown failure.

use std::fmt;
use thiserror::Error;

/// Main error type for observability operations
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Exporter initialization failed: {message}")]
    ExporterInit { message: String },

    #[error("Tracer provider shutdown failed: {message}")]
    Shutdown { message: String },

    #[error("Request id generation failed: {message}")]
    RequestId { message: String },

    #[error("Logging initialization failed: {message}")]
    LoggingInit { message: String },

    #[error("Setup step '{step}' failed: {message}")]
    Setup { step: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Trace error: {0}")]
    Trace(#[from] opentelemetry::trace::TraceError),
}

impl TelemetryError {
    /// Create exporter initialization error
    pub fn exporter_init<S: Into<String>>(message: S) -> Self {
        Self::ExporterInit {
            message: message.into(),
        }
    }

    /// Create shutdown error
    pub fn shutdown<S: Into<String>>(message: S) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Create request id generation error
    pub fn request_id<S: Into<String>>(message: S) -> Self {
        Self::RequestId {
            message: message.into(),
        }
    }

    /// Create logging initialization error
    pub fn logging_init<S: Into<String>>(message: S) -> Self {
        Self::LoggingInit {
            message: message.into(),
        }
    }

    /// Create setup step error
    pub fn setup<S: Into<String>, M: Into<String>>(step: S, message: M) -> Self {
        Self::Setup {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Result type for observability operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// A single teardown action that returned an error
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name the action was registered under
    pub action: String,
    pub source: TelemetryError,
}

/// Every failure collected while running a composed teardown.
///
/// Teardown keeps going after a failed action, so this holds one entry per
/// failed action in registration order.
#[derive(Debug)]
pub struct TeardownError {
    failures: Vec<TeardownFailure>,
}

impl TeardownError {
    pub(crate) fn new(failures: Vec<TeardownFailure>) -> Self {
        Self { failures }
    }

    /// All collected failures, in the order the actions ran
    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether an action registered under `action` failed
    pub fn contains(&self, action: &str) -> bool {
        self.failures.iter().any(|f| f.action == action)
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", failure.action, failure.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| &f.source as &(dyn std::error::Error + 'static))
    }
}
