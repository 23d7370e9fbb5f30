use std::fmt;
use std::hash::{Hash, Hasher};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

/// Absolute tolerance used when comparing `Double` values.
pub const DOUBLE_TOLERANCE: f64 = 1e-7;

/// An immutable tagged value: exactly one of string, 64-bit integer,
/// double or byte array.
///
/// `Primitive` is the only value type the memory service stores and the
/// only value type a database key may carry.
#[derive(Debug, Clone)]
pub enum Primitive {
    String(String),
    Integer(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Primitive {
    /// kind returns the name of the active variant, used in messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Primitive::String(_) => "String",
            Primitive::Integer(_) => "Integer",
            Primitive::Double(_) => "Double",
            Primitive::Bytes(_) => "Bytes",
        }
    }

    /// to_json projects the value into its JSON form: strings and
    /// integers map to their native JSON types, doubles stay numbers and
    /// byte arrays become base64 strings.
    pub fn to_json(&self) -> Value {
        match self {
            Primitive::String(s) => Value::String(s.clone()),
            Primitive::Integer(i) => Value::Number((*i).into()),
            Primitive::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Primitive::Bytes(b) => Value::String(STANDARD.encode(b)),
        }
    }

    /// to_key_string renders the value as the string used in mutex keys
    /// and in backup artifacts: numbers are stringified and byte arrays
    /// are base64 encoded.
    pub fn to_key_string(&self) -> String {
        match self {
            Primitive::String(s) => s.clone(),
            Primitive::Integer(i) => i.to_string(),
            Primitive::Double(d) => d.to_string(),
            Primitive::Bytes(b) => STANDARD.encode(b),
        }
    }

    /// from_json converts a scalar JSON value back into a primitive.
    /// Objects, arrays, booleans and null have no primitive form.
    pub fn from_json(value: &Value) -> Option<Primitive> {
        match value {
            Value::String(s) => Some(Primitive::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Primitive::Integer(i))
                } else {
                    n.as_f64().map(Primitive::Double)
                }
            }
            _ => None,
        }
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Primitive::String(a), Primitive::String(b)) => a == b,
            (Primitive::Integer(a), Primitive::Integer(b)) => a == b,
            (Primitive::Double(a), Primitive::Double(b)) => (a - b).abs() <= DOUBLE_TOLERANCE,
            (Primitive::Bytes(a), Primitive::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Primitive {}

impl Hash for Primitive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Primitive::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Primitive::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            // Tolerance equality cannot be sharpened into buckets, so all
            // doubles share one hash to stay consistent with eq.
            Primitive::Double(_) => {
                2u8.hash(state);
            }
            Primitive::Bytes(b) => {
                3u8.hash(state);
                b.hash(state);
            }
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}

impl From<&str> for Primitive {
    fn from(v: &str) -> Self {
        Primitive::String(v.to_string())
    }
}

impl From<String> for Primitive {
    fn from(v: String) -> Self {
        Primitive::String(v)
    }
}

impl From<i64> for Primitive {
    fn from(v: i64) -> Self {
        Primitive::Integer(v)
    }
}

impl From<f64> for Primitive {
    fn from(v: f64) -> Self {
        Primitive::Double(v)
    }
}

impl From<Vec<u8>> for Primitive {
    fn from(v: Vec<u8>) -> Self {
        Primitive::Bytes(v)
    }
}
