//! Context-carried observability
//!
//! Attaches a structured logger, a tracer, log fields and span attributes to an
//! immutable [`Context`] so any code holding the context can log and trace
//! without threading those handles through every call.
//!
//! # Overview
//!
//! - [`context`]: the immutable, hierarchical context store
//! - [`lifecycle`]: ordered option composition with a combined teardown
//! - [`fields`] and [`logger`]: field accumulation and leveled emission
//! - [`tracer`]: lazy spans, attribute accumulation, OpenTelemetry backend
//! - [`middleware`]: per-request scoping with a `warp` filter
//! - [`config`] and [`subscriber`]: TOML configuration and `tracing` setup
//!
//! # Quick Start
//!
//! ```rust
//! use context_observability::{
//!     fields, info, start_span, with_fields, Attributes, Composer, LoggerHandle, TracingLogger,
//! };
//!
//! let (ctx, teardown) = Composer::new()
//!     .with_logger(LoggerHandle::new(TracingLogger))
//!     .with_fields(fields!["service" => "checkout"])
//!     .build();
//!
//! let ctx = with_fields(&ctx, fields!["order_id" => 42]);
//! info(&ctx, "order accepted", &fields!["items" => 3]);
//!
//! // No tracer attached: the guard is inert
//! let (_ctx, mut span) = start_span(&ctx, "charge", Attributes::new());
//! span.end();
//!
//! teardown.run().unwrap();
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fields;
pub mod lifecycle;
pub mod logger;
pub mod middleware;
pub mod subscriber;
pub mod testing;
pub mod tracer;

pub use config::{ConfigError, ObservabilityConfig};
pub use context::Context;
pub use error::{TeardownError, TeardownFailure, TelemetryError, TelemetryResult};
pub use fields::{fields, render_fields, with_fields, Field, Value};
pub use lifecycle::{
    compose, Composer, ContextOption, SetupStep, Teardown, TeardownAction, TeardownGuard,
};
pub use logger::{
    debug, error, info, log, logger, warn, with_logger, Logger, LoggerHandle, NoopLogger,
    TracingLogger,
};
pub use middleware::{RequestLogging, RequestScope};
pub use tracer::{
    attributes, current_span, in_span, in_span_async, noop_tracer, register_global_provider,
    start_span, tracer, with_attributes, with_tracer, with_tracer_handle, Attributes,
    ExporterKind, NoopSpan, NoopTracer, OtelProvider, OtelSpan, OtelTracer, Span, SpanGuard,
    SpanHandle, Tracer, TracerConfig, TracerHandle,
};
