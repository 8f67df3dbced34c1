//! Transactional writer: stage documents, then commit them all or none.
//!
//! # Commit Flow
//!
//! 1. Importer calls [`Database::begin_transaction`]; an id is reserved and a
//!    `New` journal entry written
//! 2. Importer stages documents with [`Writer::insert`]; nothing is visible yet
//! 3. [`Writer::commit`] takes the database write lock and:
//!    - validates every staged document against its collection (`InsertError`)
//!    - checks batch rules per kind (`ConsistencyError`)
//!    - inserts everything, records per-collection counts, marks `Committed`
//! 4. Any failure, including failing to write the batch to disk, marks the
//!    entry `Error` and leaves every collection as it was
//!
//! Batch rules per document kind:
//!
//! - **Geometry**: none. Several revisions of one name in one batch are legal;
//!   the latest transaction wins at resolution time and all revisions persist.
//! - **Calibration**: one batch may not stage two revisions of the same
//!   `(name, type)` with the same first valid run. Re-staging a run that is
//!   already stored is legal: it is how history gets corrected.
//! - **Status**: content-identical re-insertion of a `(name, type)` already
//!   staged or stored is dropped silently; different content is a conflict.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::document::{DedupKey, Document, DocumentKind, FIELD_TXN_ID, RunNumber};
use crate::error::{
    CollectionError, ConsistencyError, GcdError, InsertError, Result, TransactionError,
};
use crate::predicate::Predicate;
use crate::schema::CollectionConfig;
use crate::store::{Database, DatabaseState};
use crate::transaction::{TransactionStatus, TxnId};
use crate::value::PATH_SEPARATOR;

/// A document waiting for commit.
#[derive(Debug)]
struct Staged {
    collection: String,
    doc: Document,
}

/// Client-side buffer of one transaction's documents.
///
/// Obtained from [`Database::begin_transaction`]. Dropping a writer without
/// committing marks its journal entry `RolledBack`.
#[derive(Debug)]
pub struct Writer<'db> {
    db: &'db Database,
    id: TxnId,
    staged: Vec<Staged>,
    finished: bool,
}

impl<'db> Writer<'db> {
    pub(crate) fn new(db: &'db Database, id: TxnId) -> Self {
        Self {
            db,
            id,
            staged: Vec::new(),
            finished: false,
        }
    }

    /// This transaction's id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Number of staged documents.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Stages `doc` for insertion into `collection`, tagging it with this
    /// transaction's id. Returns the staging index within this batch.
    ///
    /// Nothing is validated or made visible until [`Writer::commit`].
    pub fn insert(&mut self, collection: impl Into<String>, mut doc: Document) -> usize {
        doc.txn_id = Some(self.id);
        self.staged.push(Staged {
            collection: collection.into(),
            doc,
        });
        self.staged.len() - 1
    }

    /// Validates and commits every staged document atomically.
    ///
    /// Returns the transaction id on success. On failure nothing was made
    /// visible, the journal entry is `Error`, and the original error is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`InsertError`] for a malformed document or wrong-kind collection
    /// - [`ConsistencyError`] for a batch rule violation
    /// - [`CollectionError`] for an unknown collection or declared-key collision
    /// - [`TransactionError::InvalidTransition`] if the entry was rolled back
    ///   from elsewhere while this writer was open
    /// - [`StoreError`](crate::error::StoreError) if the batch cannot be written
    ///   to disk; it is removed again and the entry marked `Error`
    pub fn commit(mut self) -> Result<TxnId> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let id = self.id;
        let db = self.db;

        let mut state = db.state.write();
        let status = state
            .journal
            .get(id)
            .map(|r| r.status)
            .ok_or(TransactionError::Unknown { id })?;
        if status != TransactionStatus::New {
            return Err(TransactionError::InvalidTransition {
                id,
                from: status,
                to: TransactionStatus::Committed,
            }
            .into());
        }

        let affected = match apply_batch(&mut state, id, staged) {
            Ok(affected) => affected,
            Err(err) => {
                record_failure(db, &mut state, id, std::iter::empty());
                tracing::warn!(txn = %id, error = %err, "commit failed, batch discarded");
                return Err(err);
            }
        };

        // The Committed entry must be durable before it is published.
        let mut journal = state.journal.clone();
        journal.transition(id, TransactionStatus::Committed)?;
        journal.set_affected(id, affected.clone());
        let names = affected.keys().map(String::as_str);
        if let Err(err) = db.persist_with(&state.collections, &journal, names) {
            remove_batch(&mut state, id, affected.keys());
            record_failure(db, &mut state, id, affected.keys().map(String::as_str));
            tracing::warn!(txn = %id, error = %err, "commit not persisted, batch discarded");
            return Err(err);
        }
        state.journal = journal;
        tracing::info!(txn = %id, ?affected, "committed transaction");
        Ok(id)
    }

    /// Discards every staged document and marks the entry `RolledBack`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) if the journal cannot be persisted.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.staged.clear();
        self.db.rollback(self.id).map(|_| ())
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::debug!(txn = %self.id, staged = self.staged.len(), "writer dropped without commit");
        if let Err(e) = self.db.rollback(self.id) {
            tracing::warn!(txn = %self.id, error = %e, "failed to roll back abandoned transaction");
        }
    }
}

/// Validates a batch and inserts it, returning per-collection counts.
///
/// On error every collection is exactly as it was on entry.
fn apply_batch(
    state: &mut DatabaseState,
    id: TxnId,
    staged: Vec<Staged>,
) -> Result<BTreeMap<String, usize>> {
    for Staged { collection, doc } in &staged {
        let config = state
            .collections
            .get(collection)
            .map(|c| c.config())
            .ok_or_else(|| CollectionError::UnknownCollection {
                name: collection.clone(),
            })?;
        validate_document(config, doc)?;
    }

    let accepted = check_batch_rules(state, staged)?;

    let mut affected: BTreeMap<String, usize> = BTreeMap::new();
    for Staged { collection, doc } in accepted {
        let inserted = state
            .collections
            .get_mut(&collection)
            .ok_or_else(|| CollectionError::UnknownCollection {
                name: collection.clone(),
            })
            .map_err(GcdError::from)
            .and_then(|c| c.insert_one(doc));
        if let Err(err) = inserted {
            remove_batch(state, id, affected.keys());
            return Err(err);
        }
        *affected.entry(collection).or_default() += 1;
    }
    Ok(affected)
}

/// Deletes every document tagged with `id` from the named collections.
fn remove_batch<'a>(
    state: &mut DatabaseState,
    id: TxnId,
    names: impl IntoIterator<Item = &'a String>,
) {
    let tagged = Predicate::eq(FIELD_TXN_ID, id.as_i64());
    for name in names {
        if let Some(c) = state.collections.get_mut(name) {
            c.delete_where(&tagged);
        }
    }
}

/// Marks `id` as `Error` and persists the journal plus the named collections.
///
/// A persistence failure here is only logged; the caller returns the error
/// that made the commit fail.
fn record_failure<'a>(
    db: &Database,
    state: &mut DatabaseState,
    id: TxnId,
    names: impl IntoIterator<Item = &'a str>,
) {
    if let Err(e) = state.journal.transition(id, TransactionStatus::Error) {
        tracing::error!(txn = %id, error = %e, "failed to mark transaction as errored");
        return;
    }
    if let Err(e) = db.persist(state, names) {
        tracing::error!(txn = %id, error = %e, "failed to persist errored transaction");
    }
}

/// Checks one staged document against its collection's schema.
fn validate_document(config: &CollectionConfig, doc: &Document) -> Result<()> {
    if doc.kind != config.kind {
        return Err(InsertError::WrongKind {
            collection: config.name.clone(),
            kind: doc.kind.to_string(),
            name: doc.name.clone(),
        }
        .into());
    }
    let missing = |field| InsertError::MissingField {
        collection: config.name.clone(),
        name: doc.name.clone(),
        field,
    };
    if doc.name.is_empty() {
        return Err(missing("name").into());
    }
    if doc.doc_type.is_empty() {
        return Err(missing("type").into());
    }
    match doc.kind {
        DocumentKind::Calibration if doc.valid_from_run.is_none() => {
            return Err(missing("valid_from_run").into());
        }
        DocumentKind::Status if doc.valid_from_run.is_some() => {
            return Err(InsertError::UnexpectedField {
                collection: config.name.clone(),
                name: doc.name.clone(),
                field: "valid_from_run",
            }
            .into());
        }
        _ => {}
    }
    if let Some(key) = doc
        .payload
        .keys()
        .find(|k| k.is_empty() || k.contains(PATH_SEPARATOR))
    {
        return Err(InsertError::InvalidKey {
            name: doc.name.clone(),
            key: key.clone(),
        }
        .into());
    }
    Ok(())
}

/// Applies the per-kind batch rules, returning the documents to insert.
fn check_batch_rules(state: &DatabaseState, staged: Vec<Staged>) -> Result<Vec<Staged>> {
    let mut calibration_runs: HashSet<(String, DedupKey, RunNumber)> = HashSet::new();
    let mut status_seen: HashMap<(String, DedupKey), usize> = HashMap::new();
    let mut accepted: Vec<Staged> = Vec::with_capacity(staged.len());

    for entry in staged {
        match entry.doc.kind {
            DocumentKind::Geometry => {}
            DocumentKind::Calibration => {
                let run = entry.doc.valid_from_run.unwrap_or_default();
                let key = entry.doc.dedup_key();
                if !calibration_runs.insert((entry.collection.clone(), key.clone(), run)) {
                    return Err(ConsistencyError::DuplicateValidity {
                        name: key.name,
                        doc_type: key.doc_type.unwrap_or_default(),
                        run,
                    }
                    .into());
                }
            }
            DocumentKind::Status => {
                let key = entry.doc.dedup_key();
                let conflict = || ConsistencyError::StatusConflict {
                    name: entry.doc.name.clone(),
                    doc_type: entry.doc.doc_type.clone(),
                };

                if let Some(&index) = status_seen.get(&(entry.collection.clone(), key.clone())) {
                    if accepted[index].doc.same_content(&entry.doc) {
                        tracing::debug!(name = %key, "dropping duplicate status document in batch");
                        continue;
                    }
                    return Err(conflict().into());
                }

                let stored = state
                    .collections
                    .get(&entry.collection)
                    .map(|c| {
                        c.find(
                            Predicate::and([
                                Predicate::eq("name", entry.doc.name.as_str()),
                                Predicate::eq("type", entry.doc.doc_type.as_str()),
                            ]),
                            0,
                        )
                        .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if !stored.is_empty() {
                    if stored.iter().any(|s| s.same_content(&entry.doc)) {
                        tracing::debug!(name = %key, "status document already stored, skipping");
                        continue;
                    }
                    return Err(conflict().into());
                }
                status_seen.insert((entry.collection.clone(), key), accepted.len());
            }
        }
        accepted.push(entry);
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StoreConfig, UniqueIndex};
    use crate::transaction::Provenance;

    fn db() -> Database {
        Database::in_memory(StoreConfig::default()).unwrap()
    }

    fn begin(db: &Database) -> Writer<'_> {
        db.begin_transaction(Provenance::new("tester", "localhost", "test")).unwrap()
    }

    #[test]
    fn test_insert_stages_without_visibility() {
        let db = db();
        let mut writer = begin(&db);
        assert_eq!(writer.insert("geometry", Document::geometry("a", "Module")), 0);
        assert_eq!(writer.insert("geometry", Document::geometry("b", "Module")), 1);
        assert_eq!(writer.staged_len(), 2);
        assert_eq!(db.collection_counts()["geometry"], 0);
        let id = writer.commit().unwrap();
        assert_eq!(db.collection_counts()["geometry"], 2);
        let record = db.transaction(id).unwrap();
        assert_eq!(record.status, TransactionStatus::Committed);
        assert_eq!(record.affected.get("geometry"), Some(&2));
    }

    #[test]
    fn test_committed_documents_carry_txn_id() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("geometry", Document::geometry("a", "Module"));
        let id = writer.commit().unwrap();
        let doc = db.find("geometry", Predicate::all(), 0).unwrap().next().unwrap();
        assert_eq!(doc.txn_id, Some(id));
    }

    #[test]
    fn test_same_batch_geometry_revisions_are_allowed() {
        let db = db();
        let mut writer = begin(&db);
        let doc = Document::geometry("a", "Module").with("position", 1);
        writer.insert("geometry", doc.clone());
        writer.insert("geometry", doc);
        writer.insert("geometry", Document::geometry("a", "Module").with("position", 2));
        writer.commit().unwrap();
        assert_eq!(db.collection_counts()["geometry"], 3);
    }

    #[test]
    fn test_schema_violations_are_insert_errors() {
        let cases = vec![
            ("geometry", Document::calibration("a", "NoiseRate", 1)),
            ("calibration", {
                let mut doc = Document::calibration("a", "NoiseRate", 1);
                doc.valid_from_run = None;
                doc
            }),
            ("status", Document::status("", "Configuration")),
            ("status", Document::status("a", "")),
            ("status", {
                let mut doc = Document::status("a", "DOMSettings");
                doc.valid_from_run = Some(3);
                doc
            }),
            ("geometry", Document::geometry("a", "Module").with("bad.key", 1)),
            ("geometry", Document::geometry("a", "Module").with("", 1)),
        ];
        for (collection, doc) in cases {
            let db = db();
            let mut writer = begin(&db);
            writer.insert("geometry", Document::geometry("valid", "Module"));
            writer.insert(collection, doc);
            let id = writer.id();
            let err = writer.commit().unwrap_err();
            assert!(matches!(err, GcdError::Insert(_)), "unexpected {err:?}");
            assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::Error);
            assert!(db.collection_counts().values().all(|&n| n == 0));
        }
    }

    #[test]
    fn test_unknown_collection_fails_commit() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("nope", Document::geometry("a", "Module"));
        let err = writer.commit().unwrap_err();
        assert!(matches!(err, GcdError::Collection(CollectionError::UnknownCollection { .. })));
    }

    #[test]
    fn test_duplicate_calibration_validity_in_batch() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("calibration", Document::calibration("a", "NoiseRate", 5).with("rate_hz", 1.0));
        writer.insert("calibration", Document::calibration("a", "NoiseRate", 6).with("rate_hz", 2.0));
        writer.insert("calibration", Document::calibration("a", "Gain", 5).with("gain", 3.0));
        writer.insert("calibration", Document::calibration("a", "NoiseRate", 5).with("rate_hz", 4.0));
        let err = writer.commit().unwrap_err();
        assert!(matches!(
            err,
            GcdError::Consistency(ConsistencyError::DuplicateValidity { run: 5, .. })
        ));
        assert_eq!(db.collection_counts()["calibration"], 0);
    }

    #[test]
    fn test_declared_key_collision_discards_whole_batch() {
        let config = StoreConfig::new(vec![
            CollectionConfig::new("geometry", DocumentKind::Geometry),
            CollectionConfig::new("runs", DocumentKind::Status)
                .with_unique(UniqueIndex::new(["payload.run_id"])),
        ])
        .unwrap();
        let db = Database::in_memory(config).unwrap();
        let mut writer = begin(&db);
        writer.insert("geometry", Document::geometry("21-30", "Module"));
        writer.insert("runs", Document::status("physics", "Run").with("run_id", 7));
        writer.insert("runs", Document::status("calibration", "Run").with("run_id", 7));
        let id = writer.id();

        let err = writer.commit().unwrap_err();
        assert!(matches!(err, GcdError::Collection(CollectionError::DuplicateKey { .. })));
        assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::Error);
        assert!(db.collection_counts().values().all(|&n| n == 0));

        // The index no longer remembers the discarded key.
        let mut writer = begin(&db);
        writer.insert("runs", Document::status("physics", "Run").with("run_id", 7));
        writer.commit().unwrap();
        assert_eq!(db.collection_counts()["runs"], 1);
    }

    #[test]
    fn test_status_deduplicated_within_batch() {
        let db = db();
        let mut writer = begin(&db);
        let doc = Document::status("hv", "DOMSettings").with("voltage", 1300);
        writer.insert("status", doc.clone());
        writer.insert("status", doc);
        let id = writer.commit().unwrap();
        assert_eq!(db.collection_counts()["status"], 1);
        assert_eq!(db.transaction(id).unwrap().affected.get("status"), Some(&1));
    }

    #[test]
    fn test_status_conflict_within_batch() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("status", Document::status("hv", "DOMSettings").with("voltage", 1300));
        writer.insert("status", Document::status("hv", "DOMSettings").with("voltage", 1350));
        assert!(matches!(
            writer.commit(),
            Err(GcdError::Consistency(ConsistencyError::StatusConflict { .. }))
        ));
    }

    #[test]
    fn test_abort_discards_batch() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("geometry", Document::geometry("a", "Module"));
        let id = writer.id();
        writer.abort().unwrap();
        assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::RolledBack);
        assert_eq!(db.collection_counts()["geometry"], 0);
    }

    #[test]
    fn test_commit_after_external_rollback_fails() {
        let db = db();
        let mut writer = begin(&db);
        writer.insert("geometry", Document::geometry("a", "Module"));
        db.rollback(writer.id()).unwrap();
        assert!(matches!(
            writer.commit(),
            Err(GcdError::Transaction(TransactionError::InvalidTransition { .. }))
        ));
        assert_eq!(db.collection_counts()["geometry"], 0);
    }

    #[test]
    fn test_empty_commit() {
        let db = db();
        let id = begin(&db).commit().unwrap();
        let record = db.transaction(id).unwrap();
        assert_eq!(record.status, TransactionStatus::Committed);
        assert!(record.affected.is_empty());
    }
}
