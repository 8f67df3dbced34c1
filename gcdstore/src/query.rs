//! Query results for reading documents from collections.
//!
//! [`Cursor`] is what `find` and `aggregate` return. It owns a snapshot of
//! the documents it ranges over (cheap `Arc` clones taken under the store's
//! read lock), so iterating never holds a lock and never observes a commit
//! that lands mid-iteration.
//!
//! A `find` cursor is lazy: the predicate is evaluated as the cursor advances.
//! Every cursor is restartable via [`Cursor::rewind`].
//!
//! # Example Usage
//!
//! ```rust
//! # use gcdstore::{Database, Document, Predicate, Provenance, StoreConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let db = Database::in_memory(StoreConfig::default())?;
//! # let mut writer = db.begin_transaction(Provenance::default())?;
//! # writer.insert("geometry", Document::geometry("21-30", "Module").with("string", 21));
//! # writer.commit()?;
//! let mut cursor = db.find("geometry", Predicate::eq("payload.string", 21), 0)?;
//! let first_pass = cursor.by_ref().count();
//! cursor.rewind();
//! assert_eq!(cursor.count(), first_pass);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::document::Document;
use crate::predicate::Predicate;

/// Lazy, restartable sequence of documents.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Snapshot the cursor ranges over.
    docs: Arc<[Arc<Document>]>,
    /// Filter evaluated while advancing; `None` yields every document.
    predicate: Option<Predicate>,
    /// Maximum number of documents to yield; 0 means unlimited.
    limit: usize,
    /// Next snapshot index to examine.
    position: usize,
    /// Documents yielded since the last rewind.
    yielded: usize,
}

impl Cursor {
    /// Creates a cursor filtering `docs` by `predicate`, yielding at most
    /// `limit` documents (0 = unlimited).
    pub fn new(docs: Arc<[Arc<Document>]>, predicate: Option<Predicate>, limit: usize) -> Self {
        Self {
            docs,
            predicate,
            limit,
            position: 0,
            yielded: 0,
        }
    }

    /// Creates a cursor over already-computed results.
    pub fn from_results(docs: Vec<Arc<Document>>) -> Self {
        Self::new(docs.into(), None, 0)
    }

    /// Restarts iteration from the beginning of the snapshot.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.yielded = 0;
    }

    /// Collects the remaining documents into a vector.
    pub fn collect_all(self) -> Vec<Arc<Document>> {
        self.collect()
    }

    /// Size of the underlying snapshot, before filtering and limit.
    pub fn snapshot_len(&self) -> usize {
        self.docs.len()
    }
}

impl Iterator for Cursor {
    type Item = Arc<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit != 0 && self.yielded >= self.limit {
            return None;
        }
        while let Some(doc) = self.docs.get(self.position) {
            self.position += 1;
            let accepted = self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate.matches(doc));
            if accepted {
                self.yielded += 1;
                return Some(Arc::clone(doc));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Arc<[Arc<Document>]> {
        (0..6)
            .map(|i| Arc::new(Document::geometry(format!("dom-{i}"), "Module").with("position", i)))
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_unfiltered_cursor_yields_everything() {
        let cursor = Cursor::new(snapshot(), None, 0);
        assert_eq!(cursor.snapshot_len(), 6);
        assert_eq!(cursor.count(), 6);
    }

    #[test]
    fn test_limit_applies_after_filtering() {
        let cursor = Cursor::new(snapshot(), Some(Predicate::gte("payload.position", 2)), 3);
        let names: Vec<_> = cursor.map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["dom-2", "dom-3", "dom-4"]);
    }

    #[test]
    fn test_rewind_restarts() {
        let mut cursor = Cursor::new(snapshot(), Some(Predicate::lt("payload.position", 2)), 0);
        assert_eq!(cursor.next().map(|d| d.name.clone()).as_deref(), Some("dom-0"));
        assert_eq!(cursor.by_ref().count(), 1);
        assert!(cursor.next().is_none());
        cursor.rewind();
        assert_eq!(cursor.collect_all().len(), 2);
    }
}
