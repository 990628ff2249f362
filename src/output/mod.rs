//! Record model and output sinks.
//!
//! Trackers emit records as a string tag, an event timestamp, and a nested
//! key/value document. Sinks own the wire encoding and transport; the
//! trackers never depend on either.

mod file;
mod forward;

pub use file::FileSink;
pub use forward::ForwardSink;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::OutputError;

/// One value inside a record document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// Nested document
    Doc(Doc),
}

impl Value {
    /// String content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float content, if this is a float value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Doc> for Value {
    fn from(v: Doc) -> Self {
        Value::Doc(v)
    }
}

/// A nested key -> value document, ordered by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Doc {
    entries: BTreeMap<String, Value>,
}

impl Doc {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, overwriting any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Destination for emitted records.
pub trait Sink {
    /// Emit one record.
    fn emit(&mut self, tag: &str, ts: i64, doc: Doc) -> Result<(), OutputError>;
}

/// A fully formed record, as collected by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tag: String,
    pub ts: i64,
    pub doc: Doc,
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records emitted so far.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Records with a given tag.
    pub fn with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Record> {
        self.records.iter().filter(move |r| r.tag == tag)
    }

    /// Drop all collected records.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Sink for MemorySink {
    fn emit(&mut self, tag: &str, ts: i64, doc: Doc) -> Result<(), OutputError> {
        self.records.push(Record {
            tag: tag.to_string(),
            ts,
            doc,
        });
        Ok(())
    }
}
