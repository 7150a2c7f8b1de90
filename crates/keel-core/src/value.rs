//! Dynamic field values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically-typed field value.
///
/// Entities store their scalar properties as `Value`s, change set payloads
/// carry them to the driver, and drivers hand them back in returned rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values (composite keys, inline to-many identifiers)
    Array(Vec<Value>),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of integral values (used for key sequences).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Timestamp(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Borrowed text of `Text` and `Decimal` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical textual form used to build serialized primary keys.
    ///
    /// Integers of different widths render identically so `Int(1)` and
    /// `BigInt(1)` address the same identity.
    pub fn identity_fragment(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) | Value::Timestamp(i) => i.to_string(),
            Value::Double(f) => f.to_string(),
            Value::Decimal(s) | Value::Text(s) => s.clone(),
            Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
            Value::Uuid(u) => u.iter().map(|byte| format!("{byte:02x}")).collect(),
            Value::Json(j) => j.to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::identity_fragment)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Increment a version value, starting from 1 for NULL.
    pub fn next_version(&self) -> Value {
        match self {
            Value::Int(v) => Value::Int(v.saturating_add(1)),
            Value::BigInt(v) => Value::BigInt(v.saturating_add(1)),
            Value::Timestamp(v) => Value::Timestamp(v.saturating_add(1)),
            _ => Value::Int(1),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other.identity_fragment()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}
