//! Append-only document collections.
//!
//! A [`Collection`] stores committed documents under synthetic insertion ids
//! and answers predicate queries and aggregation pipelines. It knows nothing
//! about transactions or dedup keys: those are commit-time rules enforced by
//! the [`Writer`](crate::writer::Writer). The only constraints a collection
//! enforces itself are the uniqueness indexes declared in its
//! [`CollectionConfig`].
//!
//! Collections are plain data. Concurrency is provided by the owning
//! [`Database`](crate::store::Database), which guards all collections behind
//! one lock so a commit spanning several collections becomes visible at once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{CollectionError, Result};
use crate::pipeline::{self, Stage};
use crate::predicate::Predicate;
use crate::query::Cursor;
use crate::schema::{CollectionConfig, UniqueIndex};

/// Synthetic per-collection insertion id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub u64);

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored document with its insertion id, as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Insertion id.
    pub id: DocId,
    /// The document.
    #[serde(flatten)]
    pub document: Document,
}

/// An append-only set of documents.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Configuration, including declared uniqueness constraints.
    config: CollectionConfig,
    /// Documents by insertion id; iteration order is insertion order.
    docs: BTreeMap<DocId, Arc<Document>>,
    /// One key map per declared constraint: canonical key bytes -> owner.
    unique: Vec<HashMap<Vec<u8>, DocId>>,
    /// Next insertion id.
    next_id: u64,
}

impl Collection {
    /// Creates an empty collection.
    pub fn new(config: CollectionConfig) -> Self {
        let unique = vec![HashMap::new(); config.unique.len()];
        Self {
            config,
            docs: BTreeMap::new(),
            unique,
            next_id: 0,
        }
    }

    /// Rebuilds a collection from persisted documents, preserving their ids.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::DuplicateKey`] if the stored documents
    /// violate a declared constraint.
    pub fn from_stored(config: CollectionConfig, stored: Vec<StoredDocument>) -> Result<Self> {
        let mut collection = Self::new(config);
        for StoredDocument { id, document } in stored {
            collection.insert_with_id(id, Arc::new(document))?;
        }
        Ok(collection)
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Collection configuration.
    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Returns the document stored under `id`.
    pub fn get(&self, id: DocId) -> Option<&Arc<Document>> {
        self.docs.get(&id)
    }

    /// Inserts one document and returns its insertion id.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::DuplicateKey`] if the document collides
    /// with a declared uniqueness constraint; the collection is unchanged.
    pub fn insert_one(&mut self, doc: Document) -> Result<DocId> {
        self.insert_shared(Arc::new(doc))
    }

    /// Inserts an already shared document.
    ///
    /// # Errors
    ///
    /// Same as [`Collection::insert_one`].
    pub fn insert_shared(&mut self, doc: Arc<Document>) -> Result<DocId> {
        let id = DocId(self.next_id);
        self.insert_with_id(id, doc)?;
        Ok(id)
    }

    fn insert_with_id(&mut self, id: DocId, doc: Arc<Document>) -> Result<()> {
        let keys = self
            .config
            .unique
            .iter()
            .map(|index| unique_key(index, &doc))
            .collect::<Vec<_>>();

        for ((index, map), key) in self.config.unique.iter().zip(&self.unique).zip(&keys) {
            if let Some(key) = key
                && map.contains_key(key)
            {
                return Err(CollectionError::DuplicateKey {
                    collection: self.config.name.clone(),
                    fields: index.fields.clone(),
                    values: render_key(index, &doc),
                }
                .into());
            }
        }
        if self.docs.contains_key(&id) {
            return Err(CollectionError::DuplicateKey {
                collection: self.config.name.clone(),
                fields: vec!["_id".to_string()],
                values: id.to_string(),
            }
            .into());
        }

        for (map, key) in self.unique.iter_mut().zip(keys) {
            if let Some(key) = key {
                map.insert(key, id);
            }
        }
        self.docs.insert(id, doc);
        self.next_id = self.next_id.max(id.0 + 1);
        Ok(())
    }

    /// Returns documents matching `predicate`, at most `limit` of them
    /// (0 = unlimited).
    pub fn find(&self, predicate: Predicate, limit: usize) -> Cursor {
        Cursor::new(self.snapshot().into(), Some(predicate), limit)
    }

    /// Runs an aggregation pipeline over the collection.
    pub fn aggregate(&self, stages: &[Stage]) -> Cursor {
        Cursor::from_results(pipeline::run(stages, self.snapshot()))
    }

    /// All documents in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<Document>> {
        self.docs.values().cloned().collect()
    }

    /// Removes every document matching `predicate`, returning how many were removed.
    pub fn delete_where(&mut self, predicate: &Predicate) -> usize {
        let doomed: Vec<DocId> = self
            .docs
            .iter()
            .filter(|(_, doc)| predicate.matches(doc))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.docs.remove(id);
        }
        for map in &mut self.unique {
            map.retain(|_, owner| !doomed.contains(owner));
        }
        doomed.len()
    }

    /// Documents with their ids, for persistence.
    pub fn stored(&self) -> Vec<StoredDocument> {
        self.docs
            .iter()
            .map(|(id, doc)| StoredDocument {
                id: *id,
                document: Document::clone(doc),
            })
            .collect()
    }
}

fn unique_key(index: &UniqueIndex, doc: &Document) -> Option<Vec<u8>> {
    let mut key = Vec::new();
    for field in &index.fields {
        doc.field(field)?.encode_canonical(&mut key);
    }
    Some(key)
}

fn render_key(index: &UniqueIndex, doc: &Document) -> String {
    index
        .fields
        .iter()
        .map(|field| doc.field(field).map_or_else(|| "null".to_string(), |v| v.to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKind;
    use crate::error::GcdError;
    use crate::pipeline::SortKey;
    use crate::transaction::TxnId;

    fn runs_collection() -> Collection {
        Collection::new(
            CollectionConfig::new("runs", DocumentKind::Status)
                .with_unique(UniqueIndex::new(["payload.run_id"])),
        )
    }

    fn geometry(name: &str, txn: u64) -> Document {
        let mut doc = Document::geometry(name, "Module").with("txn", i64::try_from(txn).unwrap());
        doc.txn_id = Some(TxnId(txn));
        doc
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let mut collection = Collection::new(CollectionConfig::new("geometry", DocumentKind::Geometry));
        let a = collection.insert_one(geometry("a", 0)).unwrap();
        let b = collection.insert_one(geometry("a", 1)).unwrap();
        assert!(a < b);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.get(b).map(|d| d.txn_id), Some(Some(TxnId(1))));
    }

    #[test]
    fn test_declared_uniqueness() {
        let mut collection = runs_collection();
        collection
            .insert_one(Document::status("r1", "Run").with("run_id", 100))
            .unwrap();
        let err = collection
            .insert_one(Document::status("r2", "Run").with("run_id", 100))
            .unwrap_err();
        assert!(matches!(err, GcdError::Collection(CollectionError::DuplicateKey { .. })));
        assert_eq!(collection.len(), 1);

        // Sparse: documents without the field are unconstrained.
        collection.insert_one(Document::status("r3", "Run")).unwrap();
        collection.insert_one(Document::status("r4", "Run")).unwrap();
        assert_eq!(collection.len(), 3);
    }

    #[test]
    fn test_delete_frees_unique_keys() {
        let mut collection = runs_collection();
        collection
            .insert_one(Document::status("r1", "Run").with("run_id", 100))
            .unwrap();
        assert_eq!(collection.delete_where(&Predicate::eq("name", "r1")), 1);
        assert!(collection.is_empty());
        collection
            .insert_one(Document::status("r1", "Run").with("run_id", 100))
            .unwrap();
    }

    #[test]
    fn test_find_and_aggregate() {
        let mut collection = Collection::new(CollectionConfig::new("geometry", DocumentKind::Geometry));
        for (name, txn) in [("a", 2), ("b", 0), ("a", 1), ("b", 3)] {
            collection.insert_one(geometry(name, txn)).unwrap();
        }
        assert_eq!(collection.find(Predicate::eq("name", "a"), 0).count(), 2);
        assert_eq!(collection.find(Predicate::all(), 3).count(), 3);

        let latest: Vec<_> = collection
            .aggregate(&[
                Stage::Sort(vec![SortKey::asc("txn_id")]),
                Stage::GroupLast(vec!["name".to_string()]),
            ])
            .map(|d| (d.name.clone(), d.txn_id.unwrap().0))
            .collect();
        assert_eq!(latest, vec![("b".to_string(), 3), ("a".to_string(), 2)]);
    }

    #[test]
    fn test_stored_roundtrip_preserves_ids() {
        let mut collection = runs_collection();
        collection.insert_one(Document::status("r1", "Run").with("run_id", 1)).unwrap();
        collection.insert_one(Document::status("r2", "Run").with("run_id", 2)).unwrap();
        collection.delete_where(&Predicate::eq("name", "r1"));

        let json = serde_json::to_string(&collection.stored()).unwrap();
        let stored: Vec<StoredDocument> = serde_json::from_str(&json).unwrap();
        let mut reloaded = Collection::from_stored(collection.config().clone(), stored).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get(DocId(1)).is_some());
        assert_eq!(reloaded.insert_one(Document::status("r3", "Run")).unwrap(), DocId(2));
    }
}
