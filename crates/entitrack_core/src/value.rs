//! Dynamic property value type.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A dynamic property value.
///
/// Floats are intentionally not supported so that equality and hashing are
/// total; every value can take part in an identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (supports full i64 range).
    Integer(i64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string. Compared by content.
    Bytes(Vec<u8>),
    /// UUID value.
    Uuid(Uuid),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a UUID, if it is one.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Structural comparison used for relationship snapshots.
    ///
    /// Byte strings compare by content, so two distinct buffers holding the
    /// same bytes are equal.
    pub fn structurally_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a.as_slice() == b.as_slice(),
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text. Behaves like a reference type: defaults to null.
    Text,
    /// Byte string. Behaves like a reference type: defaults to null.
    Bytes,
    /// UUID.
    Uuid,
}

impl ValueKind {
    /// Returns the default value of a non-nullable property of this kind.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Uuid => Value::Uuid(Uuid::nil()),
            ValueKind::Text | ValueKind::Bytes => Value::Null,
        }
    }

    /// Returns true if `value` can be stored in a property of this kind.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ValueKind::Bool, Value::Bool(_))
                | (ValueKind::Integer, Value::Integer(_))
                | (ValueKind::Text, Value::Text(_))
                | (ValueKind::Bytes, Value::Bytes(_))
                | (ValueKind::Uuid, Value::Uuid(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_strings_compare_structurally() {
        let a = Value::Bytes(vec![1, 2, 3]);
        let b = Value::from(vec![1u8, 2, 3]);
        assert!(a.structurally_equals(&b));
        assert_eq!(a, b);
        assert!(!a.structurally_equals(&Value::Bytes(vec![1, 2])));
    }

    #[test]
    fn kind_defaults() {
        assert_eq!(ValueKind::Integer.default_value(), Value::Integer(0));
        assert_eq!(ValueKind::Bool.default_value(), Value::Bool(false));
        assert_eq!(ValueKind::Uuid.default_value(), Value::Uuid(Uuid::nil()));
        assert!(ValueKind::Text.default_value().is_null());
    }

    #[test]
    fn kind_accepts_matching_values_and_null() {
        assert!(ValueKind::Integer.accepts(&Value::Integer(5)));
        assert!(ValueKind::Integer.accepts(&Value::Null));
        assert!(!ValueKind::Integer.accepts(&Value::Text("5".into())));
    }

    #[test]
    fn display() {
        assert_eq!(Value::Integer(7).to_string(), "7");
        assert_eq!(Value::from("a").to_string(), "'a'");
        assert_eq!(Value::Bytes(vec![0xab, 0x01]).to_string(), "0xab01");
        assert_eq!(Value::from(None::<i64>).to_string(), "null");
    }
}
