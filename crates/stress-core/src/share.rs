use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A value stashed by one hook for a later step of the same iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ShareValue {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl ShareValue {
    /// Raw bytes of `Bytes` and `Text` values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ShareValue::Bytes(b) => Some(b),
            ShareValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ShareValue::Text(s) => Some(s),
            ShareValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ShareValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Bytes> for ShareValue {
    fn from(b: Bytes) -> Self {
        ShareValue::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for ShareValue {
    fn from(b: Vec<u8>) -> Self {
        ShareValue::Bytes(b)
    }
}

impl From<String> for ShareValue {
    fn from(s: String) -> Self {
        ShareValue::Text(s)
    }
}

impl From<&str> for ShareValue {
    fn from(s: &str) -> Self {
        ShareValue::Text(s.to_string())
    }
}

impl From<i64> for ShareValue {
    fn from(v: i64) -> Self {
        ShareValue::Int(v)
    }
}

impl From<f64> for ShareValue {
    fn from(v: f64) -> Self {
        ShareValue::Float(v)
    }
}

impl From<bool> for ShareValue {
    fn from(v: bool) -> Self {
        ShareValue::Bool(v)
    }
}

impl From<serde_json::Value> for ShareValue {
    fn from(v: serde_json::Value) -> Self {
        ShareValue::Json(v)
    }
}

/// Per-iteration context handed to every hook of one transaction iteration.
///
/// A fresh `Share` is created at the start of each iteration and dropped at
/// its end, so nothing leaks between iterations or workers. Keys are a
/// contract between the hook authors of the steps in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Share {
    values: HashMap<String, ShareValue>,
}

impl Share {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ShareValue>,
    ) -> Option<ShareValue> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ShareValue> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ShareValue> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
