//! XML-RPC value model
//!
//! Only the types the CCU actually puts on the wire are modelled. Scalars can
//! be flattened to a `(kind, text)` pair for storage and restored from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single XML-RPC value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Double(f64),
    String(String),
    Base64(Vec<u8>),
    /// `dateTime.iso8601`, kept verbatim
    DateTime(String),
    Nil,
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

/// Scalar type tag used when a value is persisted as text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Int,
    Double,
    String,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::String => "string",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "boolean" => Some(ValueKind::Boolean),
            "int" => Some(ValueKind::Int),
            "double" => Some(ValueKind::Double),
            "string" => Some(ValueKind::String),
            _ => None,
        }
    }
}

impl Value {
    /// Empty string, the conventional "ok" answer of a callback
    pub fn empty() -> Self {
        Value::String(String::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Scalar kind, `None` for containers and exotic types
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Boolean(_) => Some(ValueKind::Boolean),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Double(_) => Some(ValueKind::Double),
            Value::String(_) => Some(ValueKind::String),
            _ => None,
        }
    }

    /// Flatten a scalar into its storage form.
    ///
    /// Base64 and dateTime values are stored as strings; containers and nil
    /// cannot be stored and yield `None`.
    pub fn to_stored(&self) -> Option<(ValueKind, String)> {
        match self {
            Value::Boolean(b) => Some((ValueKind::Boolean, if *b { "1" } else { "0" }.into())),
            Value::Int(i) => Some((ValueKind::Int, i.to_string())),
            Value::Double(d) => Some((ValueKind::Double, d.to_string())),
            Value::String(s) | Value::DateTime(s) => Some((ValueKind::String, s.clone())),
            Value::Base64(bytes) => Some((
                ValueKind::String,
                String::from_utf8_lossy(bytes).into_owned(),
            )),
            Value::Nil | Value::Array(_) | Value::Struct(_) => None,
        }
    }

    /// Inverse of [`Value::to_stored`]
    pub fn from_stored(kind: ValueKind, text: &str) -> Option<Self> {
        match kind {
            ValueKind::Boolean => match text {
                "1" | "true" => Some(Value::Boolean(true)),
                "0" | "false" => Some(Value::Boolean(false)),
                _ => None,
            },
            ValueKind::Int => text.parse().ok().map(Value::Int),
            ValueKind::Double => text.parse().ok().map(Value::Double),
            ValueKind::String => Some(Value::String(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) | Value::DateTime(s) => write!(f, "{s:?}"),
            Value::Base64(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Nil => write!(f, "nil"),
            Value::Array(items) => write!(f, "[{} items]", items.len()),
            Value::Struct(members) => write!(f, "{{{} members}}", members.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
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

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_form_keeps_scalar_type() {
        for value in [
            Value::Boolean(true),
            Value::Int(-3),
            Value::Double(21.5),
            Value::from("OPEN"),
        ] {
            let (kind, text) = value.to_stored().unwrap();
            assert_eq!(Value::from_stored(kind, &text), Some(value));
        }
    }

    #[test]
    fn test_containers_are_not_storable() {
        assert!(Value::Array(vec![]).to_stored().is_none());
        assert!(Value::Nil.to_stored().is_none());
    }

    #[test]
    fn test_corrupt_stored_text() {
        assert_eq!(Value::from_stored(ValueKind::Int, "abc"), None);
        assert_eq!(Value::from_stored(ValueKind::Boolean, "maybe"), None);
    }
}
