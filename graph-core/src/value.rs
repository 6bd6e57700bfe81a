//! Dynamically typed property values.
//!
//! Grounded on the teacher's `core/src/value/mod.rs` `Value`/`ValueType`
//! split: a closed enum carrying the decoded variant, with a `ValueType`
//! tag used for cast-aware comparison in the query evaluator
//! (`core/src/selection/filter.rs`'s `compare_values_with_cast`).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Value = Null | Bool | Number | String | NodeRef | List, per spec §9's
/// design note replacing "dynamic property values (`unknown` JSON)".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    NodeRef(NodeId),
    List(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Number,
    String,
    NodeRef,
    List,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::NodeRef(_) => ValueType::NodeRef,
            Value::List(_) => ValueType::List,
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Coerce a string-numeric into a number, as used by the aggregator
    /// (spec §4.8: "coerce string-numerics via standard parse").
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Serialize to the JSON text stored alongside properties, preserving
    /// round-trip fidelity even for variants JSON doesn't natively carry
    /// (`NodeRef` is encoded as its ULID string).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::NodeRef(id) => serde_json::Value::String(id.to_string()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Parse a JSON text blob into a `Value`. Malformed JSON is the caller's
    /// concern to skip (spec §4.3: "malformed JSON in a property value is
    /// silently skipped").
    pub fn from_json_str(raw: &str) -> Result<Value, serde_json::Error> {
        let json: serde_json::Value = serde_json::from_str(raw)?;
        Ok(Value::from_json(&json))
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => {
                // A node-reference-shaped string (ULID-length, base32) is decoded lazily by
                // the caller that knows the field's semantics; here it is just a string.
                Value::String(s.clone())
            }
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(_) => Value::String(json.to_string()),
        }
    }

    /// Identifier-shaped heuristic used by `relinkTo` with no explicit
    /// target (spec §4.3: "length-based heuristic").
    pub fn looks_like_node_id(&self) -> bool {
        match self {
            Value::NodeRef(_) => true,
            Value::String(s) => s.len() == 26 && s.chars().all(|c| c.is_ascii_alphanumeric()),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::NodeRef(a), Value::NodeRef(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::NodeRef(id) => write!(f, "{id}"),
            Value::List(items) => write!(f, "[{}]", items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")),
        }
    }
}

/// Compare two values with numeric-family casting, mirroring the teacher's
/// `compare_values_with_cast` (`core/src/selection/filter.rs`): mismatched
/// type *families* (e.g. string vs. number) never compare equal or ordered.
pub fn compare(left: &Value, right: &Value, op: impl Fn(Ordering) -> bool) -> bool {
    if left.value_type() == right.value_type() {
        return left.partial_cmp(right).map(op).unwrap_or(false);
    }
    // Numeric family: allow string-numeric coercion for comparisons against a Number.
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            if let (Some(l), Some(r)) = (left.coerce_number(), right.coerce_number()) {
                return l.partial_cmp(&r).map(op).unwrap_or(false);
            }
            false
        }
        _ => false,
    }
}
