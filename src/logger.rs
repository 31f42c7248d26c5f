//! Structured logger capability
//!
//! A [`LoggerHandle`] is attached to a context with [`with_logger`] and resolved
//! with [`logger`]. When nothing is attached the process-wide no-op handle is
//! returned, so emission never needs a presence check at the call site.
//!
//! The leveled functions ([`debug`], [`info`], [`warn`], [`error`]) merge the
//! accumulated context fields with the call-site fields (call-site last), bind
//! them onto the handle and emit exactly one record.

use crate::context::Context;
use crate::fields::{fields, render_fields, Field};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use tracing::Level;

/// Logging backend capability
///
/// Implementations receive every record synchronously. Failures inside the
/// backend are the backend's to absorb.
pub trait Logger: Send + Sync {
    /// Emit one record at `level` with the fully merged field sequence
    fn log(&self, level: Level, message: &str, fields: &[Field]);

    /// Whether this backend drops every record
    fn is_noop(&self) -> bool {
        false
    }
}

/// Logger that silently drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _message: &str, _fields: &[Field]) {}

    fn is_noop(&self) -> bool {
        true
    }
}

/// Logger that forwards records into the `tracing` ecosystem
///
/// The message becomes the event message and the merged fields are rendered
/// as one JSON object under the `fields` key.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str, fields: &[Field]) {
        let rendered = render_fields(fields);
        match level {
            Level::ERROR => tracing::error!(fields = %rendered, "{}", message),
            Level::WARN => tracing::warn!(fields = %rendered, "{}", message),
            Level::INFO => tracing::info!(fields = %rendered, "{}", message),
            Level::DEBUG => tracing::debug!(fields = %rendered, "{}", message),
            _ => tracing::trace!(fields = %rendered, "{}", message),
        }
    }
}

static NOOP_LOGGER: Lazy<LoggerHandle> = Lazy::new(|| LoggerHandle::new(NoopLogger));

/// Cheap-to-clone reference to a logging backend plus pre-bound fields
#[derive(Clone)]
pub struct LoggerHandle {
    backend: Arc<dyn Logger>,
    bound: Arc<[Field]>,
}

impl LoggerHandle {
    pub fn new<L: Logger + 'static>(backend: L) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Logger>) -> Self {
        Self {
            backend,
            bound: Arc::from(Vec::new()),
        }
    }

    /// The process-wide no-op handle
    pub fn noop() -> Self {
        NOOP_LOGGER.clone()
    }

    /// New handle emitting to the same backend with `fields` bound after the
    /// fields this handle already carries
    pub fn with(&self, fields: &[Field]) -> Self {
        if fields.is_empty() {
            return self.clone();
        }
        let mut bound = Vec::with_capacity(self.bound.len() + fields.len());
        bound.extend_from_slice(&self.bound);
        bound.extend_from_slice(fields);
        Self {
            backend: Arc::clone(&self.backend),
            bound: Arc::from(bound),
        }
    }

    /// Fields bound onto this handle
    pub fn bound_fields(&self) -> &[Field] {
        &self.bound
    }

    pub fn log(&self, level: Level, message: &str) {
        self.backend.log(level, message, &self.bound);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }

    pub fn is_noop(&self) -> bool {
        self.backend.is_noop()
    }

    /// Whether both handles emit to the same backend instance
    pub fn same_as(&self, other: &LoggerHandle) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerHandle")
            .field("noop", &self.is_noop())
            .field("bound", &self.bound)
            .finish()
    }
}

struct LoggerSlot(LoggerHandle);

/// Derive a context whose subtree logs through `handle`
pub fn with_logger(ctx: &Context, handle: LoggerHandle) -> Context {
    ctx.with_value(LoggerSlot(handle))
}

/// Logger attached nearest to `ctx`, or the no-op handle
pub fn logger(ctx: &Context) -> LoggerHandle {
    ctx.value::<LoggerSlot>()
        .map(|slot| slot.0.clone())
        .unwrap_or_else(LoggerHandle::noop)
}

fn attached_logger(ctx: &Context) -> Option<&LoggerHandle> {
    ctx.value::<LoggerSlot>()
        .map(|slot| &slot.0)
        .filter(|handle| !handle.is_noop())
}

/// Emit one record at `level`: context fields first, then `extra`
pub fn log(ctx: &Context, level: Level, message: &str, extra: &[Field]) {
    let handle = logger(ctx);
    if handle.is_noop() {
        return;
    }

    let mut merged = fields(ctx);
    merged.extend_from_slice(extra);
    handle.with(&merged).log(level, message);
}

pub fn debug(ctx: &Context, message: &str, extra: &[Field]) {
    log(ctx, Level::DEBUG, message, extra);
}

pub fn info(ctx: &Context, message: &str, extra: &[Field]) {
    log(ctx, Level::INFO, message, extra);
}

pub fn warn(ctx: &Context, message: &str, extra: &[Field]) {
    log(ctx, Level::WARN, message, extra);
}

pub fn error(ctx: &Context, message: &str, extra: &[Field]) {
    log(ctx, Level::ERROR, message, extra);
}

/// Report a non-fatal failure through whatever logger is reachable.
///
/// Falls back to the process-wide `tracing` subscriber when the context has no
/// logger yet (for example while the composer is still applying options).
pub(crate) fn report_failure(
    ctx: &Context,
    level: Level,
    message: &str,
    err: &dyn std::error::Error,
) {
    if attached_logger(ctx).is_some() {
        log(ctx, level, message, &[Field::error(err)]);
        return;
    }

    match level {
        Level::ERROR => tracing::error!(error = %err, "{}", message),
        _ => tracing::warn!(error = %err, "{}", message),
    }
}
