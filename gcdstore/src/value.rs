//! Payload values carried by documents.
//!
//! Document payloads are loosely typed in the detector-configuration world:
//! a noise-rate calibration is a couple of floats, a DOM-settings status
//! record is a nested map, a tank record lists module names. [`Value`] is the
//! closed tagged union these payloads are built from. Consumers pattern-match
//! on the variants they expect; nothing is silently coerced except the
//! numeric Int/Float comparison used by predicates and sorts.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator for dotted field paths (`payload.gain.high`).
pub const PATH_SEPARATOR: char = '.';

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    /// Explicit absence of a value.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested map, keys kept sorted.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the variant name, used in diagnostics and diff reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }

    /// Returns the integer if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the number as `f64` if this is an `Int` or a `Float`.
    #[allow(clippy::cast_precision_loss)] // Calibration constants are well within f64 range
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string slice if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is a `Map`.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Follows a dotted path through nested maps.
    ///
    /// An empty path returns `self`. Any segment that hits a non-map value or
    /// a missing key yields `None`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use gcdstore::Value;
    /// use std::collections::BTreeMap;
    ///
    /// let inner = BTreeMap::from([("high".to_string(), Value::Float(1e7))]);
    /// let outer = Value::Map(BTreeMap::from([("gain".to_string(), Value::Map(inner))]));
    /// assert_eq!(outer.get_path("gain.high"), Some(&Value::Float(1e7)));
    /// assert_eq!(outer.get_path("gain.low"), None);
    /// ```
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split(PATH_SEPARATOR)
            .try_fold(self, |current, segment| current.as_map()?.get(segment))
    }

    /// Compares two values for predicates and sorting.
    ///
    /// Ints and floats compare numerically with each other. Strings, bools,
    /// bytes and arrays compare within their own variant; arrays
    /// lexicographically. Any other pairing, and NaN, is incomparable.
    #[allow(clippy::cast_precision_loss)] // Mixed int/float comparison is approximate by nature
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Array(a), Self::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => {}
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Self::Map(a), Self::Map(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }

    /// Equality as seen by predicates: numeric across Int/Float, structural otherwise.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Appends a canonical byte encoding of this value to `out`.
    ///
    /// Two values produce the same bytes exactly when they are structurally
    /// identical (floats by bit pattern, with `-0.0` folded into `0.0`). Used
    /// for grouping keys and content hashes.
    pub fn encode_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(0),
            Self::Bool(b) => {
                out.push(1);
                out.push(u8::from(*b));
            }
            Self::Int(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Self::Float(v) => {
                out.push(3);
                let normalized = if *v == 0.0 { 0.0f64 } else { *v };
                out.extend_from_slice(&normalized.to_bits().to_le_bytes());
            }
            Self::String(s) => {
                out.push(4);
                encode_len_prefixed(s.as_bytes(), out);
            }
            Self::Bytes(b) => {
                out.push(5);
                encode_len_prefixed(b, out);
            }
            Self::Array(items) => {
                out.push(6);
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.encode_canonical(out);
                }
            }
            Self::Map(map) => {
                out.push(7);
                out.extend_from_slice(&(map.len() as u64).to_le_bytes());
                for (key, value) in map {
                    encode_len_prefixed(key.as_bytes(), out);
                    value.encode_canonical(out);
                }
            }
        }
    }

    /// Converts a plain JSON value (as written by importers) into a `Value`.
    ///
    /// Integral numbers become `Int`, all other numbers `Float`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders this value as plain JSON, for CLI output.
    ///
    /// Bytes are rendered as an array of numbers; non-finite floats as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::Value::from(b.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn encode_len_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Array(_) | Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}
