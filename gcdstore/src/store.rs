//! Store module for the gcdstore versioned document store.
//!
//! This module provides the top-level [`Database`] handle that ties
//! collections, the transaction journal and the id counter together.
//!
//! # Design
//!
//! The Database acts as the central coordinator:
//! - Owns every [`Collection`] and the [`Journal`] behind one reader/writer
//!   lock, so a commit touching several collections becomes visible at once
//! - Owns the [`TxnCounter`]; reserving a transaction id is the only step
//!   serialized across writers, and it is a single atomic increment
//! - Hands out [`Writer`]s for batched, all-or-nothing insertion
//! - Optionally persists its state to a directory after every commit and
//!   rollback
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── meta.json          <- Format version and collection configs with hashes
//! ├── journal.json       <- Every transaction record
//! ├── geometry.json      <- Documents of the "geometry" collection
//! ├── calibration.json
//! └── status.json
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use gcdstore::{Database, Document, Provenance, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open("./gcd_store", StoreConfig::default())?;
//!
//! let mut writer = db.begin_transaction(Provenance::from_env())?;
//! writer.insert("calibration", Document::calibration("21-30", "NoiseRate", 120_000).with("rate_hz", 812.5));
//! let txn = writer.commit()?;
//!
//! // Undo the whole batch later if needed
//! db.rollback(txn)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::collection::{Collection, StoredDocument};
use crate::document::{Document, FIELD_TXN_ID};
use crate::error::{CollectionError, Result, StoreError, TransactionError};
use crate::pipeline::{self, Stage};
use crate::predicate::Predicate;
use crate::query::Cursor;
use crate::schema::{CollectionConfig, StoreConfig};
use crate::transaction::{
    Journal, Provenance, TransactionRecord, TransactionStatus, TxnCounter, TxnId,
};
use crate::writer::Writer;

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the store directory.
const METADATA_FILE: &str = "meta.json";

/// Name of the journal file in the store directory.
const JOURNAL_FILE: &str = "journal.json";

/// Top-level handle for a versioned document store.
///
/// # Thread Safety
///
/// `Database` is `Send + Sync`. Share it by reference or `Arc` between
/// importer threads (each with its own [`Writer`]) and resolver threads.
#[derive(Debug)]
pub struct Database {
    /// Store directory, `None` for in-memory stores.
    path: Option<PathBuf>,
    /// Collection configuration the store was opened with.
    config: StoreConfig,
    /// Source of transaction ids.
    counter: TxnCounter,
    /// Collections and journal, guarded together.
    pub(crate) state: RwLock<DatabaseState>,
}

/// Everything guarded by the database lock.
#[derive(Debug)]
pub(crate) struct DatabaseState {
    /// Collections by name.
    pub(crate) collections: BTreeMap<String, Collection>,
    /// Transaction journal.
    pub(crate) journal: Journal,
}

/// Metadata stored in the store's meta.json file.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    /// Metadata format version.
    version: u32,
    /// Collection configurations with their hashes for validation.
    collections: Vec<CollectionWithHash>,
}

/// Collection configuration with computed hash for validation.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionWithHash {
    /// The collection configuration.
    #[serde(flatten)]
    config: CollectionConfig,
    /// Pre-computed stable hash for validation.
    hash: u64,
}

/// Outcome of [`Database::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackSummary {
    /// The transaction rolled back.
    pub id: TxnId,
    /// Status before the call.
    pub previous: TransactionStatus,
    /// Status after the call.
    pub status: TransactionStatus,
    /// Documents removed per collection.
    pub removed: BTreeMap<String, usize>,
}

/// A consistent, lock-free view of every collection at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    collections: BTreeMap<String, Arc<[Arc<Document>]>>,
    next_txn: TxnId,
}

impl Snapshot {
    /// Documents of `collection` in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`] for an unknown name.
    pub fn documents(&self, collection: &str) -> Result<&[Arc<Document>]> {
        self.collections
            .get(collection)
            .map(|docs| &docs[..])
            .ok_or_else(|| unknown(collection))
    }

    /// Same as [`Database::find`], against this snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`] for an unknown name.
    pub fn find(&self, collection: &str, predicate: Predicate, limit: usize) -> Result<Cursor> {
        let docs = self
            .collections
            .get(collection)
            .ok_or_else(|| unknown(collection))?;
        Ok(Cursor::new(Arc::clone(docs), Some(predicate), limit))
    }

    /// Same as [`Database::aggregate`], against this snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`] for an unknown name.
    pub fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Cursor> {
        let docs = self.documents(collection)?.to_vec();
        Ok(Cursor::from_results(pipeline::run(stages, docs)))
    }

    /// The transaction id the store would hand out next when this snapshot was taken.
    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn
    }
}

fn unknown(name: &str) -> crate::error::GcdError {
    CollectionError::UnknownCollection {
        name: name.to_string(),
    }
    .into()
}

impl Database {
    /// Creates a store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if `config` is invalid.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let collections = config
            .collections
            .iter()
            .map(|c| (c.name.clone(), Collection::new(c.clone())))
            .collect();
        Ok(Self::assemble(None, config, collections, Journal::new()))
    }

    /// Creates a new store or opens an existing one at the given directory.
    ///
    /// If the directory doesn't exist it is created with a fresh `meta.json`
    /// and empty journal. Otherwise the format version and every collection
    /// hash are checked against `config`, documents and journal are loaded,
    /// and the id counter resumes after the highest journaled id. Entries
    /// left in `New` by a process that died mid-transaction are rolled back.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Io`] if the directory or a file cannot be accessed
    /// - [`StoreError::Corrupted`] if a file is malformed or the layout differs
    /// - [`StoreError::ConfigMismatch`] if a collection config changed
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;

        if path.join(METADATA_FILE).exists() {
            Self::open_existing(path, config)
        } else {
            Self::create_new(path, config)
        }
    }

    /// Reads the collection configuration recorded in an existing store's
    /// `meta.json`, for tools that open stores they did not create.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the metadata cannot be read, and
    /// [`ConfigError`](crate::error::ConfigError) if it describes an invalid
    /// configuration.
    pub fn stored_config<P: AsRef<Path>>(path: P) -> Result<StoreConfig> {
        let metadata: StoreMetadata = read_json(&path.as_ref().join(METADATA_FILE))?;
        StoreConfig::new(metadata.collections.into_iter().map(|c| c.config).collect())
    }

    fn create_new(path: PathBuf, config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let metadata = StoreMetadata {
            version: METADATA_VERSION,
            collections: config
                .collections
                .iter()
                .map(|c| CollectionWithHash {
                    hash: c.stable_hash(),
                    config: c.clone(),
                })
                .collect(),
        };
        write_json(&path.join(METADATA_FILE), &metadata)?;

        let collections = config
            .collections
            .iter()
            .map(|c| (c.name.clone(), Collection::new(c.clone())))
            .collect();
        let db = Self::assemble(Some(path), config, collections, Journal::new());
        {
            let state = db.state.read();
            db.persist(&state, state.collections.keys().map(String::as_str))?;
        }
        tracing::info!(path = %db.display_path(), "created store");
        Ok(db)
    }

    fn open_existing(path: PathBuf, config: StoreConfig) -> Result<Self> {
        let metadata_path = path.join(METADATA_FILE);
        let metadata: StoreMetadata = read_json(&metadata_path)?;

        if metadata.version != METADATA_VERSION {
            return Err(StoreError::Corrupted {
                path: metadata_path.display().to_string(),
                reason: format!(
                    "unsupported metadata version: expected {}, found {}",
                    METADATA_VERSION, metadata.version
                ),
            }
            .into());
        }
        if metadata.collections.len() != config.collections.len() {
            return Err(StoreError::Corrupted {
                path: metadata_path.display().to_string(),
                reason: format!(
                    "collection count mismatch: expected {}, found {}",
                    config.collections.len(),
                    metadata.collections.len()
                ),
            }
            .into());
        }
        for (provided, stored) in config.collections.iter().zip(&metadata.collections) {
            if provided.name != stored.config.name {
                return Err(StoreError::Corrupted {
                    path: metadata_path.display().to_string(),
                    reason: format!(
                        "collection name mismatch: expected '{}', found '{}'",
                        provided.name, stored.config.name
                    ),
                }
                .into());
            }
            let expected = provided.stable_hash();
            if expected != stored.hash {
                return Err(StoreError::ConfigMismatch {
                    collection: provided.name.clone(),
                    existing: stored.hash,
                    expected,
                }
                .into());
            }
        }

        let mut collections = BTreeMap::new();
        for collection_config in &config.collections {
            let file = collection_file(&path, &collection_config.name);
            let stored: Vec<StoredDocument> = if file.exists() {
                read_json(&file)?
            } else {
                Vec::new()
            };
            let collection = Collection::from_stored(collection_config.clone(), stored)?;
            collections.insert(collection_config.name.clone(), collection);
        }

        let journal_path = path.join(JOURNAL_FILE);
        let records: Vec<TransactionRecord> = if journal_path.exists() {
            read_json(&journal_path)?
        } else {
            Vec::new()
        };
        let journal = Journal::from_records(records)?;

        let db = Self::assemble(Some(path), config, collections, journal);
        db.recover_interrupted()?;
        tracing::info!(
            path = %db.display_path(),
            next_txn = %db.next_txn_id(),
            "opened store"
        );
        Ok(db)
    }

    fn assemble(
        path: Option<PathBuf>,
        config: StoreConfig,
        collections: BTreeMap<String, Collection>,
        journal: Journal,
    ) -> Self {
        let counter = TxnCounter::new(journal.next_id().0);
        Self {
            path,
            config,
            counter,
            state: RwLock::new(DatabaseState {
                collections,
                journal,
            }),
        }
    }

    /// Rolls back entries a previous process left in `New`.
    fn recover_interrupted(&self) -> Result<()> {
        let interrupted: Vec<TxnId> = self
            .state
            .read()
            .journal
            .iter()
            .filter(|r| r.status == TransactionStatus::New)
            .map(|r| r.id)
            .collect();
        for id in interrupted {
            tracing::warn!(txn = %id, "rolling back transaction interrupted by a previous process");
            self.rollback(id)?;
        }
        Ok(())
    }

    /// Store directory, if the store is persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| "<memory>".to_string(), |p| p.display().to_string())
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The id the next [`Database::begin_transaction`] will reserve.
    pub fn next_txn_id(&self) -> TxnId {
        self.counter.peek()
    }

    /// Starts a transaction.
    ///
    /// Reserves the next id with one atomic increment and journals a `New`
    /// entry carrying `provenance`. Any number of threads may call this
    /// concurrently; the ids they receive are distinct and contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the journal cannot be persisted.
    pub fn begin_transaction(&self, provenance: Provenance) -> Result<Writer<'_>> {
        let id = self.counter.reserve();
        {
            let mut state = self.state.write();
            state
                .journal
                .append(TransactionRecord::new(id, provenance))?;
            self.persist(&state, std::iter::empty())?;
        }
        tracing::debug!(txn = %id, "began transaction");
        Ok(Writer::new(self, id))
    }

    /// Returns documents of `collection` matching `predicate`
    /// (at most `limit`, 0 = unlimited).
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`] for an unknown name.
    pub fn find(&self, collection: &str, predicate: Predicate, limit: usize) -> Result<Cursor> {
        let state = self.state.read();
        let collection = state
            .collections
            .get(collection)
            .ok_or_else(|| unknown(collection))?;
        Ok(collection.find(predicate, limit))
    }

    /// Runs an aggregation pipeline over `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`] for an unknown name.
    pub fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Cursor> {
        let docs = {
            let state = self.state.read();
            state
                .collections
                .get(collection)
                .ok_or_else(|| unknown(collection))?
                .snapshot()
        };
        Ok(Cursor::from_results(pipeline::run(stages, docs)))
    }

    /// Takes a consistent snapshot of every collection.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot {
            collections: state
                .collections
                .iter()
                .map(|(name, c)| (name.clone(), c.snapshot().into()))
                .collect(),
            next_txn: self.counter.peek(),
        }
    }

    /// Document count per collection.
    pub fn collection_counts(&self) -> BTreeMap<String, usize> {
        self.state
            .read()
            .collections
            .iter()
            .map(|(name, c)| (name.clone(), c.len()))
            .collect()
    }

    /// Returns the journal entry for `id`.
    pub fn transaction(&self, id: TxnId) -> Option<TransactionRecord> {
        self.state.read().journal.get(id).cloned()
    }

    /// Returns every journal entry in id order.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.read().journal.iter().cloned().collect()
    }

    /// Removes every document written by transaction `id` and marks it `RolledBack`.
    ///
    /// Idempotent: an entry already `RolledBack` is left alone, and an
    /// `Error` entry has nothing to remove and keeps its status. Rolling back
    /// a `New` entry aborts the writer still holding it; that writer's commit
    /// will fail. The journal entry itself is never deleted.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Unknown`] for an unknown id, or
    /// [`StoreError`] if persisting fails.
    pub fn rollback(&self, id: TxnId) -> Result<RollbackSummary> {
        let mut state = self.state.write();
        let previous = state
            .journal
            .get(id)
            .map(|r| r.status)
            .ok_or(TransactionError::Unknown { id })?;

        let mut removed = BTreeMap::new();
        if matches!(previous, TransactionStatus::New | TransactionStatus::Committed) {
            let tagged = Predicate::eq(FIELD_TXN_ID, id.as_i64());
            for (name, collection) in &mut state.collections {
                let count = collection.delete_where(&tagged);
                if count > 0 {
                    removed.insert(name.clone(), count);
                }
            }
            state.journal.transition(id, TransactionStatus::RolledBack)?;
            self.persist(&state, removed.keys().map(String::as_str))?;
            tracing::info!(txn = %id, from = %previous, ?removed, "rolled back transaction");
        } else {
            tracing::debug!(txn = %id, status = %previous, "rollback is a no-op");
        }

        let status = state
            .journal
            .get(id)
            .map_or(previous, |r| r.status);
        Ok(RollbackSummary {
            id,
            previous,
            status,
            removed,
        })
    }

    /// Writes the journal and the named collections to disk (no-op in memory).
    pub(crate) fn persist<'a>(
        &self,
        state: &DatabaseState,
        collections: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        self.persist_with(&state.collections, &state.journal, collections)
    }

    /// Same as [`Database::persist`], with a journal that is not yet installed.
    ///
    /// Lets a commit make its `Committed` entry durable before publishing it.
    pub(crate) fn persist_with<'a>(
        &self,
        collections: &BTreeMap<String, Collection>,
        journal: &Journal,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        for name in names {
            if let Some(collection) = collections.get(name) {
                write_json(&collection_file(path, name), &collection.stored())?;
            }
        }
        let records: Vec<&TransactionRecord> = journal.iter().collect();
        write_json(&path.join(JOURNAL_FILE), &records)
    }
}

fn collection_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).map_err(|e| StoreError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&data).map_err(|e| {
        StoreError::Serde {
            path: path.display().to_string(),
            source: e,
        }
        .into()
    })
}

/// Writes `value` next to `path`, syncs it, and renames it into place.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serde {
        path: path.display().to_string(),
        source: e,
    })?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |p: &Path| {
        let p = p.display().to_string();
        move |e: std::io::Error| StoreError::Io { path: p, source: e }
    };
    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(&data).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKind;
    use crate::error::GcdError;

    fn provenance() -> Provenance {
        Provenance::new("tester", "localhost", "cargo test")
    }

    #[test]
    fn test_in_memory_store_starts_empty() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        assert!(db.path().is_none());
        assert_eq!(db.next_txn_id(), TxnId(0));
        assert!(db.transactions().is_empty());
        assert_eq!(
            db.collection_counts().keys().cloned().collect::<Vec<_>>(),
            vec!["calibration", "geometry", "status"]
        );
    }

    #[test]
    fn test_unknown_collection() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        assert!(matches!(
            db.find("nope", Predicate::all(), 0),
            Err(GcdError::Collection(CollectionError::UnknownCollection { .. }))
        ));
        assert!(db.snapshot().documents("nope").is_err());
    }

    #[test]
    fn test_begin_journals_new_entry() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        let writer = db.begin_transaction(provenance()).unwrap();
        let record = db.transaction(writer.id()).unwrap();
        assert_eq!(record.status, TransactionStatus::New);
        assert_eq!(record.provenance.actor, "tester");
        assert_eq!(db.next_txn_id(), TxnId(1));
        drop(writer);
        assert_eq!(db.transaction(TxnId(0)).unwrap().status, TransactionStatus::RolledBack);
    }

    #[test]
    fn test_rollback_unknown_transaction() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        assert!(matches!(
            db.rollback(TxnId(3)),
            Err(GcdError::Transaction(TransactionError::Unknown { .. }))
        ));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_commits() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        let before = db.snapshot();
        let mut writer = db.begin_transaction(provenance()).unwrap();
        writer.insert("geometry", Document::geometry("21-30", "Module"));
        writer.commit().unwrap();
        assert!(before.documents("geometry").unwrap().is_empty());
        assert_eq!(db.snapshot().documents("geometry").unwrap().len(), 1);
        assert_eq!(before.next_txn_id(), TxnId(0));
    }

    #[test]
    fn test_reopen_with_changed_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        drop(Database::open(&path, StoreConfig::default()).unwrap());

        let mut changed = StoreConfig::default();
        changed.collections[0].kind = DocumentKind::Status;
        assert!(matches!(
            Database::open(&path, changed),
            Err(GcdError::Store(StoreError::ConfigMismatch { .. }))
        ));

        let fewer = StoreConfig::new(vec![CollectionConfig::new("geometry", DocumentKind::Geometry)]).unwrap();
        assert!(matches!(
            Database::open(&path, fewer),
            Err(GcdError::Store(StoreError::Corrupted { .. }))
        ));
    }
}
