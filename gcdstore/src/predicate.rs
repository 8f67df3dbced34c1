//! Field predicates used by `find` and the `Match` pipeline stage.
//!
//! The query surface is closed: a [`Predicate`] is one of a
//! handful of field tests or a combinator over them, and [`Predicate::matches`]
//! is the single interpreter. Field paths use the document field syntax
//! described in [`crate::document`].
//!
//! Comparison semantics:
//!
//! - A missing field fails every field test (and therefore satisfies `Not`).
//! - Ints and floats compare numerically; other mixed-type comparisons fail.
//! - Equality against an array field also matches when any element is equal,
//!   so `Eq("payload.doms", "21-61")` finds tanks listing that module.

use std::cmp::Ordering;

use crate::document::Document;
use crate::value::Value;

/// A boolean test over one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals value.
    Eq(String, Value),
    /// Field is strictly less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field is strictly greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Gte(String, Value),
    /// Field equals any of the values.
    In(String, Vec<Value>),
    /// Negation.
    Not(Box<Predicate>),
    /// Conjunction; the empty conjunction matches everything.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Matches every document.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    /// `field in values`.
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Negates `inner`.
    pub fn not(inner: Predicate) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Conjunction of `parts`.
    pub fn and(parts: impl IntoIterator<Item = Predicate>) -> Self {
        Self::And(parts.into_iter().collect())
    }

    /// Conjoins `other` onto this predicate, flattening nested conjunctions.
    #[must_use]
    pub fn and_also(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            single => Self::And(vec![single, other]),
        }
    }

    /// Evaluates this predicate against `doc`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use gcdstore::{Document, Predicate};
    ///
    /// let doc = Document::calibration("21-30", "NoiseRate", 120).with("rate_hz", 800.0);
    /// let applicable = Predicate::and([
    ///     Predicate::eq("type", "NoiseRate"),
    ///     Predicate::lte("valid_from_run", 150),
    ///     Predicate::gt("payload.rate_hz", 500),
    /// ]);
    /// assert!(applicable.matches(&doc));
    /// assert!(!Predicate::not(applicable).matches(&doc));
    /// ```
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Eq(field, expected) => {
                test_field(doc, field, |actual| equals_or_contains(actual, expected))
            }
            Self::Lt(field, bound) => test_ordering(doc, field, bound, Ordering::is_lt),
            Self::Lte(field, bound) => test_ordering(doc, field, bound, Ordering::is_le),
            Self::Gt(field, bound) => test_ordering(doc, field, bound, Ordering::is_gt),
            Self::Gte(field, bound) => test_ordering(doc, field, bound, Ordering::is_ge),
            Self::In(field, candidates) => test_field(doc, field, |actual| {
                candidates
                    .iter()
                    .any(|candidate| equals_or_contains(actual, candidate))
            }),
            Self::Not(inner) => !inner.matches(doc),
            Self::And(parts) => parts.iter().all(|part| part.matches(doc)),
        }
    }
}

fn test_field(doc: &Document, field: &str, test: impl FnOnce(&Value) -> bool) -> bool {
    match doc.field(field) {
        Some(actual) => test(&*actual),
        None => false,
    }
}

fn test_ordering(
    doc: &Document,
    field: &str,
    bound: &Value,
    accept: fn(Ordering) -> bool,
) -> bool {
    test_field(doc, field, |actual| actual.compare(bound).is_some_and(accept))
}

fn equals_or_contains(actual: &Value, expected: &Value) -> bool {
    if actual.loosely_equals(expected) {
        return true;
    }
    match actual {
        Value::Array(items) if !matches!(expected, Value::Array(_)) => {
            items.iter().any(|item| item.loosely_equals(expected))
        }
        _ => false,
    }
}
