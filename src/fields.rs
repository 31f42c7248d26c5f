//! Log field accumulation
//!
//! Each [`with_fields`] call attaches one node holding only the fields passed
//! to it, so accumulation is O(1). The inherited sequence is only assembled
//! when [`fields`] is called, which normally happens at the moment a record is
//! emitted.
//!
//! Duplicate keys are kept. The merged sequence preserves append order and the
//! backend decides precedence when rendering; [`render_fields`] lets the last
//! occurrence win.

use crate::context::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Loggable primitive value of a [`Field`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Duration(Duration),
    Timestamp(DateTime<Utc>),
    /// Rendered error message
    Error(String),
}

impl Value {
    /// JSON representation used when rendering records
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) | Value::Error(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Uint(u) => serde_json::Value::from(*u),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Duration(d) => serde_json::Value::String(format!("{d:?}")),
            Value::Timestamp(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) | Value::Error(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Duration(d) => write!(f, "{d:?}"),
            Value::Timestamp(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Uint(u64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Uint(u64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

/// A single key/value pair attached to log records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub key: String,
    pub value: Value,
}

impl Field {
    pub fn new<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn string<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self::new(key, Value::String(value.into()))
    }

    pub fn int<K: Into<String>>(key: K, value: i64) -> Self {
        Self::new(key, Value::Int(value))
    }

    pub fn uint<K: Into<String>>(key: K, value: u64) -> Self {
        Self::new(key, Value::Uint(value))
    }

    pub fn bool<K: Into<String>>(key: K, value: bool) -> Self {
        Self::new(key, Value::Bool(value))
    }

    pub fn duration<K: Into<String>>(key: K, value: Duration) -> Self {
        Self::new(key, Value::Duration(value))
    }

    pub fn timestamp<K: Into<String>>(key: K, value: DateTime<Utc>) -> Self {
        Self::new(key, Value::Timestamp(value))
    }

    /// Error field under the conventional `error` key
    pub fn error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::new("error", Value::Error(err.to_string()))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Build a `Vec<Field>` from `key => value` pairs
///
/// ```rust
/// use context_observability::{fields, Field};
///
/// let fs = fields!["env" => "prod", "attempt" => 3];
/// assert_eq!(fs, vec![Field::new("env", "prod"), Field::new("attempt", 3)]);
/// ```
#[macro_export]
macro_rules! fields {
    () => {
        ::std::vec::Vec::<$crate::Field>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Field::new($key, $value)),+]
    };
}

/// Fields attached by one `with_fields` call
struct FieldSet(Vec<Field>);

/// Derive a context with `fields` appended after everything already attached
pub fn with_fields<I>(ctx: &Context, fields: I) -> Context
where
    I: IntoIterator<Item = Field>,
{
    let local: Vec<Field> = fields.into_iter().collect();
    if local.is_empty() {
        return ctx.clone();
    }
    ctx.with_value(FieldSet(local))
}

/// Full inherited field sequence, parent entries first
pub fn fields(ctx: &Context) -> Vec<Field> {
    let sets: Vec<&FieldSet> = ctx.values::<FieldSet>().collect();
    let total = sets.iter().map(|set| set.0.len()).sum();

    let mut merged = Vec::with_capacity(total);
    for set in sets.into_iter().rev() {
        merged.extend(set.0.iter().cloned());
    }
    merged
}

/// Render fields as a JSON object; later duplicate keys overwrite earlier ones
pub fn render_fields(fields: &[Field]) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(fields.len());
    for field in fields {
        object.insert(field.key.clone(), field.value.to_json());
    }
    serde_json::Value::Object(object)
}
