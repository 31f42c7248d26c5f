//! Tracer and span capability
//!
//! A tracer is attached with [`with_tracer`] (OpenTelemetry, built from a
//! [`TracerConfig`]) or [`with_tracer_handle`] (any [`Tracer`] implementation).
//! Spans are started lazily with [`start_span`], which stores the live span on
//! the returned child context so [`with_attributes`] and nested spans can find
//! it.
//!
//! Span lifetime is owned by a [`SpanGuard`]: the span ends exactly once, when
//! the guard is ended explicitly or dropped on any exit path.

pub mod otel;

use crate::context::Context;
use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use otel::{
    register_global_provider, with_tracer, ExporterKind, OtelProvider, OtelSpan, OtelTracer,
    TracerConfig,
};

/// Ordered string attribute set attached to spans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Merge `other` into `self`; keys in `other` win
    pub fn merge(&mut self, other: &Attributes) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Attributes {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// One unit of traced work
pub trait Span: Send + Sync {
    /// Replace or add span attributes
    fn set_attributes(&self, attributes: &Attributes);

    /// Close the span. [`SpanGuard`] calls this exactly once per started span.
    fn end(&self);

    /// Lets a tracer recognise parents it created itself
    fn as_any(&self) -> &dyn Any;
}

/// Tracing backend capability
pub trait Tracer: Send + Sync {
    /// Start a span, parented on `parent` when one is live in the context
    fn start(&self, name: &str, parent: Option<&dyn Span>, attributes: &Attributes) -> SpanHandle;

    /// Whether this tracer produces inert spans
    fn is_noop(&self) -> bool {
        false
    }
}

pub type SpanHandle = Arc<dyn Span>;
pub type TracerHandle = Arc<dyn Tracer>;

/// Span that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpan;

impl Span for NoopSpan {
    fn set_attributes(&self, _attributes: &Attributes) {}

    fn end(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tracer that produces [`NoopSpan`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start(
        &self,
        _name: &str,
        _parent: Option<&dyn Span>,
        _attributes: &Attributes,
    ) -> SpanHandle {
        Arc::new(NoopSpan)
    }

    fn is_noop(&self) -> bool {
        true
    }
}

static NOOP_TRACER: Lazy<TracerHandle> = Lazy::new(|| Arc::new(NoopTracer));

/// The process-wide no-op tracer
pub fn noop_tracer() -> TracerHandle {
    Arc::clone(&NOOP_TRACER)
}

struct TracerSlot(TracerHandle);

/// Span started on this derivation; `ended` is shared with its guard
struct ActiveSpan {
    span: SpanHandle,
    ended: Arc<AtomicBool>,
}

impl ActiveSpan {
    fn live(&self) -> Option<&SpanHandle> {
        (!self.ended.load(Ordering::Acquire)).then_some(&self.span)
    }
}

/// Merged attribute set as of this derivation
struct AttributeSet(Attributes);

/// Derive a context whose subtree starts spans on `handle`
pub fn with_tracer_handle(ctx: &Context, handle: TracerHandle) -> Context {
    ctx.with_value(TracerSlot(handle))
}

/// Tracer attached nearest to `ctx`, or the no-op tracer
pub fn tracer(ctx: &Context) -> TracerHandle {
    ctx.value::<TracerSlot>()
        .map(|slot| Arc::clone(&slot.0))
        .unwrap_or_else(noop_tracer)
}

/// Nearest span started through [`start_span`], unless its guard has ended it
pub fn current_span(ctx: &Context) -> Option<SpanHandle> {
    ctx.value::<ActiveSpan>()
        .and_then(ActiveSpan::live)
        .map(Arc::clone)
}

/// Accumulated attributes of `ctx`
pub fn attributes(ctx: &Context) -> Attributes {
    ctx.value::<AttributeSet>()
        .map(|set| set.0.clone())
        .unwrap_or_default()
}

/// Merge `attrs` into the accumulated set and push the result onto the live
/// span, if there is one. A span whose guard already ended it is left alone.
pub fn with_attributes(ctx: &Context, attrs: Attributes) -> Context {
    let mut merged = attributes(ctx);
    merged.merge(&attrs);

    if let Some(span) = ctx.value::<ActiveSpan>().and_then(ActiveSpan::live) {
        span.set_attributes(&merged);
    }

    ctx.with_value(AttributeSet(merged))
}

/// Start a span named `name` under the context's tracer.
///
/// Without an effective tracer this returns a clone of `ctx` and an inert
/// guard. Otherwise the span carries the context attributes merged with
/// `attrs`, and the returned context exposes it to nested spans and
/// [`with_attributes`].
pub fn start_span(ctx: &Context, name: &str, attrs: Attributes) -> (Context, SpanGuard) {
    let tracer = match ctx.value::<TracerSlot>() {
        Some(slot) if !slot.0.is_noop() => Arc::clone(&slot.0),
        _ => return (ctx.clone(), SpanGuard::inert()),
    };

    let mut merged = attributes(ctx);
    merged.merge(&attrs);

    // Ended spans still parent new ones so the trace stays connected
    let parent = ctx.value::<ActiveSpan>().map(|active| active.span.as_ref());
    let span = tracer.start(name, parent, &merged);

    let ended = Arc::new(AtomicBool::new(false));
    let child = ctx.with_value(ActiveSpan {
        span: Arc::clone(&span),
        ended: Arc::clone(&ended),
    });
    (child, SpanGuard::new(span, ended))
}

/// Run `f` inside a span; the span ends when `f` returns or unwinds
pub fn in_span<T, F>(ctx: &Context, name: &str, attrs: Attributes, f: F) -> T
where
    F: FnOnce(&Context) -> T,
{
    let (child, _guard) = start_span(ctx, name, attrs);
    f(&child)
}

/// Await `f` inside a span; the span also ends if the future is dropped early
pub async fn in_span_async<T, F, Fut>(ctx: &Context, name: &str, attrs: Attributes, f: F) -> T
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = T>,
{
    let (child, mut guard) = start_span(ctx, name, attrs);
    let output = f(child).await;
    guard.end();
    output
}

/// Scope guard that ends its span exactly once
#[must_use = "dropping the guard ends the span immediately"]
pub struct SpanGuard {
    span: Option<SpanHandle>,
    ended: Option<Arc<AtomicBool>>,
}

impl SpanGuard {
    fn new(span: SpanHandle, ended: Arc<AtomicBool>) -> Self {
        Self {
            span: Some(span),
            ended: Some(ended),
        }
    }

    /// Guard with no span; ending it has no effect
    pub fn inert() -> Self {
        Self {
            span: None,
            ended: None,
        }
    }

    /// End the span. Only the first call reaches the backend.
    pub fn end(&mut self) {
        if let Some(span) = self.span.take() {
            if let Some(ended) = &self.ended {
                ended.store(true, Ordering::Release);
            }
            span.end();
        }
    }

    /// Whether the span is still open
    pub fn is_recording(&self) -> bool {
        self.span.is_some()
    }

    pub fn span(&self) -> Option<&SpanHandle> {
        self.span.as_ref()
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("recording", &self.is_recording())
            .finish()
    }
}
