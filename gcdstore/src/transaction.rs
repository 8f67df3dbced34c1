//! Transaction ids, the id counter, and the transaction journal.
//!
//! Every batch of writes is journaled as a [`TransactionRecord`] before any
//! document is staged. The record carries provenance (who, where, which
//! command) and a small lifecycle state machine:
//!
//! ```text
//!            ┌──────────► Committed ──────┐
//!            │                            ▼
//!   New ─────┼──────────────────────► RolledBack   (terminal)
//!            │
//!            └──────────► Error                    (terminal)
//! ```
//!
//! The journal is append-only: entries are never removed, and a status
//! transition is the only change an entry ever sees.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransactionError};

/// Identifier of a transaction, dense and increasing per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// The id as a signed integer, the representation used in document fields.
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    /// Reserved; documents may be staged.
    New,
    /// Documents are visible in their collections.
    Committed,
    /// Documents were removed (or never inserted). Terminal.
    RolledBack,
    /// Commit failed; nothing was inserted. Terminal.
    Error,
}

impl TransactionStatus {
    /// Whether this state may move to `next`.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Committed | Self::RolledBack | Self::Error)
                | (Self::Committed, Self::RolledBack)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RolledBack | Self::Error)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
            Self::Error => "error",
        })
    }
}

/// Who started a transaction, from where, and with which command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// User or service account.
    pub actor: String,
    /// Host the transaction was started on.
    pub host: String,
    /// Command line of the importing process.
    pub cmdline: String,
}

impl Provenance {
    /// Creates a provenance record from explicit values.
    pub fn new(
        actor: impl Into<String>,
        host: impl Into<String>,
        cmdline: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            host: host.into(),
            cmdline: cmdline.into(),
        }
    }

    /// Describes the current process: `USER`/`USERNAME`, `HOSTNAME` or
    /// `/etc/hostname`, and the process arguments joined by spaces.
    pub fn from_env() -> Self {
        let actor = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
        Self {
            actor,
            host,
            cmdline,
        }
    }
}

/// Audit record of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: TxnId,
    /// Current lifecycle state.
    pub status: TransactionStatus,
    /// Who started it.
    #[serde(flatten)]
    pub provenance: Provenance,
    /// Creation time, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
    /// Documents inserted per collection by the commit.
    #[serde(default)]
    pub affected: BTreeMap<String, usize>,
}

impl TransactionRecord {
    /// Creates a `New` record stamped with the current time.
    pub fn new(id: TxnId, provenance: Provenance) -> Self {
        #[allow(clippy::cast_possible_truncation)] // Epoch nanos fit in u64 until 2554
        let created_at_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self {
            id,
            status: TransactionStatus::New,
            provenance,
            created_at_ns,
            affected: BTreeMap::new(),
        }
    }
}

/// Owned source of transaction ids.
///
/// Reservation is a single atomic increment, so any number of concurrent
/// callers receive distinct ids forming one contiguous range. Each store owns
/// its own counter.
#[derive(Debug)]
pub struct TxnCounter {
    next: AtomicU64,
}

impl TxnCounter {
    /// Creates a counter whose first reservation returns `start`.
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Reserves the next id.
    pub fn reserve(&self) -> TxnId {
        TxnId(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// The id the next reservation will return.
    pub fn peek(&self) -> TxnId {
        TxnId(self.next.load(Ordering::Acquire))
    }
}

/// Ledger of every transaction ever started on a store.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    entries: BTreeMap<TxnId, TransactionRecord>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a journal from persisted records.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::DuplicateId`] if two records share an id.
    pub fn from_records(records: Vec<TransactionRecord>) -> Result<Self> {
        let mut journal = Self::new();
        for record in records {
            journal.append(record)?;
        }
        Ok(journal)
    }

    /// Appends a new entry. Ids are unique across the journal.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::DuplicateId`] if the id is already journaled.
    pub fn append(&mut self, record: TransactionRecord) -> Result<()> {
        if self.entries.contains_key(&record.id) {
            return Err(TransactionError::DuplicateId { id: record.id }.into());
        }
        self.entries.insert(record.id, record);
        Ok(())
    }

    /// Returns the entry for `id`.
    pub fn get(&self, id: TxnId) -> Option<&TransactionRecord> {
        self.entries.get(&id)
    }

    /// Moves an entry to `to`, returning the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Unknown`] for an unknown id and
    /// [`TransactionError::InvalidTransition`] if the lifecycle forbids the move.
    pub fn transition(&mut self, id: TxnId, to: TransactionStatus) -> Result<TransactionStatus> {
        let record = self
            .entries
            .get_mut(&id)
            .ok_or(TransactionError::Unknown { id })?;
        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(TransactionError::InvalidTransition { id, from, to }.into());
        }
        record.status = to;
        Ok(from)
    }

    /// Records per-collection insertion counts on a committed entry.
    pub(crate) fn set_affected(&mut self, id: TxnId, affected: BTreeMap<String, usize>) {
        if let Some(record) = self.entries.get_mut(&id) {
            record.affected = affected;
        }
    }

    /// Iterates entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First id not yet used by any entry.
    pub fn next_id(&self) -> TxnId {
        self.entries
            .keys()
            .next_back()
            .map_or(TxnId(0), |id| TxnId(id.0 + 1))
    }
}
