//! User-facing document value model.
//!
//! Documents are JSON-shaped: this is the type the store's public API
//! encodes from and decodes back to. Only [`Value::Map`] is ever recursed
//! into by the encoder (see [`crate::field`]): arrays, scalars, and bytes
//! are opaque leaves even when they contain nested structure.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single JSON-shaped document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered list. Never descended into by the encoder: the whole
    /// array is one LWW atom, so concurrent edits to different indices
    /// resolve by last-write-wins on the entire array.
    ///
    /// Declared before [`Value::Bytes`] so untagged deserialization prefers
    /// `Array` for plain JSON arrays of numbers; `Bytes` is reachable when
    /// constructed programmatically but is not distinguishable from a
    /// numeric array on the wire.
    Array(Vec<Value>),
    /// Raw bytes. Not part of strict JSON; treated as an opaque leaf like
    /// any other scalar.
    Bytes(Vec<u8>),
    /// An insertion-ordered string-keyed map. The only variant the encoder
    /// recurses into.
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Returns the nested map if this value is [`Value::Map`].
    #[must_use]
    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this value is a plain map that the encoder should recurse
    /// into, as opposed to an opaque leaf.
    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_values_recurse_scalars_do_not() {
        assert!(Value::Map(IndexMap::new()).is_map());
        assert!(!Value::Array(vec![]).is_map());
        assert!(!Value::String("x".into()).is_map());
        assert!(!Value::Null.is_map());
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let mut map = IndexMap::new();
        map.insert("name".to_string(), Value::String("Alice".into()));
        map.insert("age".to_string(), Value::Int(30));
        let value = Value::Map(map);
        let json = serde_json::to_value(&value).unwrap();
        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(value, back);
    }
}
