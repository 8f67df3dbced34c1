//! Field-by-field comparison of values and documents.
//!
//! Used to check two detector configurations against each other. Every
//! differing field is reported with its path (`gain.high`, `doms[3]`), so a
//! single call describes the whole discrepancy.
//!
//! Floats are compared with a relative tolerance; everything else must match
//! exactly, and an int never matches a float.

use std::fmt;
use std::sync::Arc;

use crate::document::Document;
use crate::value::Value;

/// Relative tolerance used when none is given.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// One difference between two value trees.
#[derive(Debug, Clone, PartialEq)]
pub enum Difference {
    /// Map key present only on the left.
    OnlyLeft {
        /// Path of the key.
        path: String,
    },
    /// Map key present only on the right.
    OnlyRight {
        /// Path of the key.
        path: String,
    },
    /// Arrays of different lengths.
    Length {
        /// Path of the arrays.
        path: String,
        /// Left length.
        left: usize,
        /// Right length.
        right: usize,
    },
    /// Values of different types.
    Type {
        /// Path of the values.
        path: String,
        /// Left type name.
        left: &'static str,
        /// Right type name.
        right: &'static str,
    },
    /// Scalars of the same type with different values.
    Value {
        /// Path of the values.
        path: String,
        /// Left value.
        left: Value,
        /// Right value.
        right: Value,
    },
}

impl Difference {
    /// Path of the differing field; empty for the root.
    pub fn path(&self) -> &str {
        match self {
            Self::OnlyLeft { path }
            | Self::OnlyRight { path }
            | Self::Length { path, .. }
            | Self::Type { path, .. }
            | Self::Value { path, .. } => path,
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = |path: &str| if path.is_empty() { "<root>".to_string() } else { path.to_string() };
        match self {
            Self::OnlyLeft { path } => write!(f, "{}: only in left", at(path)),
            Self::OnlyRight { path } => write!(f, "{}: only in right", at(path)),
            Self::Length { path, left, right } => {
                write!(f, "{}: length {left} != {right}", at(path))
            }
            Self::Type { path, left, right } => write!(f, "{}: type {left} != {right}", at(path)),
            Self::Value { path, left, right } => write!(f, "{}: {left} != {right}", at(path)),
        }
    }
}

/// Whether two floats agree within relative `tolerance`.
///
/// Equal values (including two zeros) and two NaNs match. When one side is
/// zero the other is checked against `tolerance` as an absolute bound.
pub fn floats_match(a: f64, b: f64, tolerance: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    if a == b {
        return true;
    }
    if a == 0.0 || b == 0.0 {
        return (a - b).abs() < tolerance;
    }
    ((a - b) / a).abs() < tolerance
}

/// Compares two values and returns every difference, in path order.
pub fn compare(left: &Value, right: &Value, tolerance: f64) -> Vec<Difference> {
    let mut out = Vec::new();
    compare_at(String::new(), left, right, tolerance, &mut out);
    out
}

/// Compares the payloads of two documents.
pub fn compare_documents(left: &Document, right: &Document, tolerance: f64) -> Vec<Difference> {
    let mut out = Vec::new();
    compare_maps(String::new(), &left.payload, &right.payload, tolerance, &mut out);
    out
}

/// Differences between two documents paired by list position.
#[derive(Debug, Clone, PartialEq)]
pub struct PairDiff {
    /// Name of the left document, `None` if the left list is shorter.
    pub left: Option<String>,
    /// Name of the right document, `None` if the right list is shorter.
    pub right: Option<String>,
    /// Payload differences; empty when one side is missing.
    pub differences: Vec<Difference>,
}

/// Compares two document lists position by position, returning only the
/// pairs that differ.
pub fn compare_lists(
    left: &[Arc<Document>],
    right: &[Arc<Document>],
    tolerance: f64,
) -> Vec<PairDiff> {
    (0..left.len().max(right.len()))
        .filter_map(|i| match (left.get(i), right.get(i)) {
            (Some(l), Some(r)) => {
                let differences = compare_documents(l, r, tolerance);
                (!differences.is_empty()).then(|| PairDiff {
                    left: Some(l.name.clone()),
                    right: Some(r.name.clone()),
                    differences,
                })
            }
            (l, r) => Some(PairDiff {
                left: l.map(|d| d.name.clone()),
                right: r.map(|d| d.name.clone()),
                differences: Vec::new(),
            }),
        })
        .collect()
}

fn compare_at(path: String, left: &Value, right: &Value, tolerance: f64, out: &mut Vec<Difference>) {
    match (left, right) {
        (Value::Map(l), Value::Map(r)) => compare_maps(path, l, r, tolerance, out),
        (Value::Array(l), Value::Array(r)) => {
            if l.len() != r.len() {
                out.push(Difference::Length {
                    path: path.clone(),
                    left: l.len(),
                    right: r.len(),
                });
            }
            for (i, (a, b)) in l.iter().zip(r).enumerate() {
                compare_at(format!("{path}[{i}]"), a, b, tolerance, out);
            }
        }
        (Value::Float(a), Value::Float(b)) => {
            if !floats_match(*a, *b, tolerance) {
                out.push(value_diff(path, left, right));
            }
        }
        (l, r) if l.type_name() != r.type_name() => out.push(Difference::Type {
            path,
            left: l.type_name(),
            right: r.type_name(),
        }),
        (l, r) => {
            if l != r {
                out.push(value_diff(path, l, r));
            }
        }
    }
}

fn compare_maps(
    path: String,
    left: &std::collections::BTreeMap<String, Value>,
    right: &std::collections::BTreeMap<String, Value>,
    tolerance: f64,
    out: &mut Vec<Difference>,
) {
    let join = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{path}.{key}")
        }
    };
    for key in left.keys().filter(|k| !right.contains_key(*k)) {
        out.push(Difference::OnlyLeft { path: join(key) });
    }
    for key in right.keys().filter(|k| !left.contains_key(*k)) {
        out.push(Difference::OnlyRight { path: join(key) });
    }
    for (key, l) in left {
        if let Some(r) = right.get(key) {
            compare_at(join(key), l, r, tolerance, out);
        }
    }
}

fn value_diff(path: String, left: &Value, right: &Value) -> Difference {
    Difference::Value {
        path,
        left: left.clone(),
        right: right.clone(),
    }
}
