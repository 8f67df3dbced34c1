//! Aggregation pipeline: `Match`, `Sort`, `GroupLast`.
//!
//! A pipeline is a list of [`Stage`]s executed strictly in order by folding
//! [`Stage::apply`] over the document sequence. The combination used
//! throughout the resolver is "sort ascending by revision, then keep the last
//! document of each group", which selects the most recent revision per key:
//!
//! ```rust
//! use gcdstore::pipeline::{Stage, SortKey};
//! use gcdstore::Predicate;
//!
//! let latest_geometry = vec![
//!     Stage::Match(Predicate::eq("name", "21-30")),
//!     Stage::Sort(vec![SortKey::asc("txn_id")]),
//!     Stage::GroupLast(vec!["name".to_string()]),
//! ];
//! # let _ = latest_geometry;
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::document::Document;
use crate::predicate::Predicate;
use crate::value::Value;

/// Sort direction of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key: a field path and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field path (see [`crate::document`]).
    pub field: String,
    /// Direction.
    pub direction: Direction,
}

impl SortKey {
    /// Ascending key on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    /// Descending key on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keeps documents matching the predicate.
    Match(Predicate),
    /// Stable sort, one pass per key in listed order.
    ///
    /// Because every pass is stable, the **last** key listed is the dominant
    /// one and earlier keys only break its ties: `[txn_id, valid_from_run]`
    /// orders by first valid run, then by transaction. Documents missing a
    /// key sort before those that have it; incomparable values keep their
    /// relative order.
    Sort(Vec<SortKey>),
    /// Partitions by the composite value of the key fields and keeps the last
    /// document of each partition. Partitions are emitted in order of first
    /// appearance; a missing key field is its own (null) group value.
    GroupLast(Vec<String>),
}

impl Stage {
    /// Applies this stage to `docs`.
    pub fn apply(&self, docs: Vec<Arc<Document>>) -> Vec<Arc<Document>> {
        match self {
            Self::Match(predicate) => docs.into_iter().filter(|d| predicate.matches(d)).collect(),
            Self::Sort(keys) => sort_documents(docs, keys),
            Self::GroupLast(fields) => group_last(docs, fields),
        }
    }
}

/// Runs `stages` in order over `docs`.
pub fn run(stages: &[Stage], docs: Vec<Arc<Document>>) -> Vec<Arc<Document>> {
    stages.iter().fold(docs, |docs, stage| stage.apply(docs))
}

fn sort_documents(mut docs: Vec<Arc<Document>>, keys: &[SortKey]) -> Vec<Arc<Document>> {
    for key in keys {
        docs.sort_by(|a, b| {
            let ordering = compare_field(a, b, &key.field);
            match key.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });
    }
    docs
}

fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    match (a.field(field), b.field(field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
    }
}

fn group_last(docs: Vec<Arc<Document>>, fields: &[String]) -> Vec<Arc<Document>> {
    let mut slots: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut groups: Vec<Arc<Document>> = Vec::new();
    for doc in docs {
        let key = group_key(&doc, fields);
        match slots.get(&key) {
            Some(&slot) => groups[slot] = doc,
            None => {
                slots.insert(key, groups.len());
                groups.push(doc);
            }
        }
    }
    groups
}

fn group_key(doc: &Document, fields: &[String]) -> Vec<u8> {
    let mut key = Vec::new();
    for field in fields {
        match doc.field(field) {
            Some(value) => value.encode_canonical(&mut key),
            None => Value::Null.encode_canonical(&mut key),
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxnId;

    fn calib(name: &str, run: i64, txn: u64) -> Arc<Document> {
        let mut doc = Document::calibration(name, "NoiseRate", run).with("txn", i64::try_from(txn).unwrap());
        doc.txn_id = Some(TxnId(txn));
        Arc::new(doc)
    }

    fn txns(docs: &[Arc<Document>]) -> Vec<u64> {
        docs.iter().map(|d| d.txn_id.unwrap().0).collect()
    }

    #[test]
    fn test_match_filters() {
        let docs = vec![calib("a", 1, 0), calib("b", 1, 1), calib("a", 2, 2)];
        let out = run(&[Stage::Match(Predicate::eq("name", "a"))], docs);
        assert_eq!(txns(&out), vec![0, 2]);
    }

    #[test]
    fn test_sort_last_key_dominates() {
        let docs = vec![calib("a", 2, 0), calib("a", 1, 3), calib("a", 1, 1), calib("a", 2, 2)];
        let keys = vec![SortKey::asc("txn_id"), SortKey::asc("valid_from_run")];
        let out = run(&[Stage::Sort(keys)], docs);
        assert_eq!(txns(&out), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_sort_descending_and_missing() {
        let mut bare = Document::geometry("g", "Module");
        bare.txn_id = None;
        let docs = vec![calib("a", 5, 1), Arc::new(bare), calib("a", 9, 2)];
        let out = run(&[Stage::Sort(vec![SortKey::desc("valid_from_run")])], docs);
        assert_eq!(out[0].valid_from_run, Some(9));
        assert_eq!(out[1].valid_from_run, Some(5));
        assert_eq!(out[2].name, "g");
    }

    #[test]
    fn test_group_last_keeps_latest_per_key() {
        let docs = vec![calib("a", 1, 0), calib("b", 1, 1), calib("a", 1, 2), calib("b", 1, 3), calib("c", 1, 4)];
        let out = run(
            &[
                Stage::Sort(vec![SortKey::asc("txn_id")]),
                Stage::GroupLast(vec!["name".to_string(), "type".to_string()]),
            ],
            docs,
        );
        assert_eq!(txns(&out), vec![2, 3, 4]);
        let names: Vec<_> = out.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_effective_revision_pipeline() {
        let docs = vec![calib("a", 1, 0), calib("a", 2, 1), calib("a", 1, 2), calib("a", 3, 3)];
        let out = run(
            &[
                Stage::Match(Predicate::lte("valid_from_run", 2)),
                Stage::Sort(vec![SortKey::asc("txn_id"), SortKey::asc("valid_from_run")]),
                Stage::GroupLast(vec!["name".to_string()]),
            ],
            docs,
        );
        assert_eq!(txns(&out), vec![1]);
    }
}
