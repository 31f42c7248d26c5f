//! In-memory logger and tracer backends
//!
//! Both record everything they receive so tests can assert on emitted records
//! and span trees without a subscriber or exporter.

use crate::fields::Field;
use crate::logger::{Logger, LoggerHandle};
use crate::tracer::{Attributes, Span, SpanHandle, Tracer, TracerHandle};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Level;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One record captured by [`MemoryLogger`]
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub fields: Vec<Field>,
}

impl LogRecord {
    /// Value of the last field named `key`, rendered as a string
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields
            .iter()
            .rev()
            .find(|f| f.key == key)
            .map(|f| f.value.to_string())
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }
}

#[derive(Default)]
struct LogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl Logger for LogSink {
    fn log(&self, level: Level, message: &str, fields: &[Field]) {
        lock(&self.records).push(LogRecord {
            level,
            message: message.to_string(),
            fields: fields.to_vec(),
        });
    }
}

/// Logger backend that keeps every record in memory
#[derive(Clone, Default)]
pub struct MemoryLogger {
    sink: Arc<LogSink>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle emitting into this logger; every call shares the same backend
    pub fn handle(&self) -> LoggerHandle {
        LoggerHandle::from_arc(self.sink.clone())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        lock(&self.sink.records).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.sink.records)
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }

    pub fn last(&self) -> Option<LogRecord> {
        lock(&self.sink.records).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.sink.records).clear();
    }
}

/// Snapshot of one span started through [`MemoryTracer`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    pub id: usize,
    pub name: String,
    pub parent: Option<usize>,
    pub attributes: Attributes,
    /// How many times the backend saw `end`
    pub end_count: usize,
}

impl RecordedSpan {
    pub fn ended(&self) -> bool {
        self.end_count > 0
    }
}

type SpanStore = Arc<Mutex<Vec<RecordedSpan>>>;

/// Span recorded into a [`MemoryTracer`]
pub struct MemorySpan {
    id: usize,
    store: SpanStore,
}

impl MemorySpan {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Span for MemorySpan {
    fn set_attributes(&self, attributes: &Attributes) {
        if let Some(span) = lock(&self.store).get_mut(self.id) {
            span.attributes.merge(attributes);
        }
    }

    fn end(&self) {
        if let Some(span) = lock(&self.store).get_mut(self.id) {
            span.end_count += 1;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct SpanRecorder {
    store: SpanStore,
}

impl Tracer for SpanRecorder {
    fn start(&self, name: &str, parent: Option<&dyn Span>, attributes: &Attributes) -> SpanHandle {
        let parent = parent
            .and_then(|p| p.as_any().downcast_ref::<MemorySpan>())
            .map(MemorySpan::id);

        let mut spans = lock(&self.store);
        let id = spans.len();
        spans.push(RecordedSpan {
            id,
            name: name.to_string(),
            parent,
            attributes: attributes.clone(),
            end_count: 0,
        });

        Arc::new(MemorySpan {
            id,
            store: Arc::clone(&self.store),
        })
    }
}

/// Tracer backend that records the span tree in memory
#[derive(Clone, Default)]
pub struct MemoryTracer {
    recorder: Arc<SpanRecorder>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> TracerHandle {
        self.recorder.clone()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        lock(&self.recorder.store).clone()
    }

    /// First span started under `name`
    pub fn span(&self, name: &str) -> Option<RecordedSpan> {
        lock(&self.recorder.store)
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }
}
