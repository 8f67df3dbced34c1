//! Error types for the gcdstore versioned document store.

use thiserror::Error;

use crate::transaction::{TransactionStatus, TxnId};

/// The main error type for all gcdstore operations.
///
/// Commit-time failures (`Insert`, `Consistency`, and `Collection` during the
/// write phase) are batch-fatal: by the time the caller sees them the batch has
/// been discarded and nothing is visible in any collection. `Resolve` errors
/// are per-field and leave the decision to the caller.
#[derive(Error, Debug)]
pub enum GcdError {
    /// Error opening, creating, or persisting a store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid store or collection configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Low-level collection failure (declared uniqueness, unknown collection).
    #[error("collection error: {0}")]
    Collection(#[from] CollectionError),

    /// A staged document is not a well-formed document for its collection.
    #[error("insert error: {0}")]
    Insert(#[from] InsertError),

    /// A batch violates a uniqueness or revision rule.
    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    /// Journal lookup or lifecycle failure.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// The resolver could not pick a single applicable revision.
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
}

/// Errors that can occur when opening, creating, or persisting a store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory or one of its files could not be accessed.
    #[error("failed to access '{path}': {source}")]
    Io {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A metadata or data file is corrupted or has an unsupported layout.
    #[error("corrupted store file '{path}': {reason}")]
    Corrupted {
        /// The offending file.
        path: String,
        /// Description of what was invalid.
        reason: String,
    },

    /// The collection configuration differs from the one the store was created with.
    #[error("collection '{collection}' config hash {existing:x} does not match expected {expected:x}")]
    ConfigMismatch {
        /// The collection whose config differs.
        collection: String,
        /// Hash found in the existing store.
        existing: u64,
        /// Hash of the config being used to open the store.
        expected: u64,
    },

    /// Failed to serialize or deserialize store state.
    #[error("serialization failed for '{path}': {source}")]
    Serde {
        /// The file being read or written.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors in store or collection configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No collections were configured.
    #[error("at least one collection must be configured")]
    NoCollections,

    /// A collection name is empty or not usable as a file name.
    #[error("invalid collection name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two collections share a name.
    #[error("collection '{name}' is configured more than once")]
    DuplicateCollection {
        /// The repeated name.
        name: String,
    },

    /// A uniqueness constraint names an empty or malformed field path.
    #[error("collection '{collection}' has an invalid unique field '{field}'")]
    InvalidUniqueField {
        /// The collection declaring the constraint.
        collection: String,
        /// The malformed field path.
        field: String,
    },
}

/// Errors raised by a single collection.
#[derive(Error, Debug)]
pub enum CollectionError {
    /// The document collides with a declared uniqueness constraint.
    #[error("duplicate key in '{collection}': {fields:?} = {values}")]
    DuplicateKey {
        /// The collection holding the constraint.
        collection: String,
        /// The constrained field paths.
        fields: Vec<String>,
        /// The colliding values, rendered for diagnostics.
        values: String,
    },

    /// No collection with this name exists in the store.
    #[error("unknown collection '{name}'")]
    UnknownCollection {
        /// The requested name.
        name: String,
    },
}

/// A staged document that is not a valid document for its collection.
#[derive(Error, Debug)]
pub enum InsertError {
    /// The collection does not accept documents of this kind.
    #[error("collection '{collection}' does not accept {kind} document '{name}'")]
    WrongKind {
        /// Target collection.
        collection: String,
        /// Document kind, as displayed.
        kind: String,
        /// Document name.
        name: String,
    },

    /// A required field is missing or empty.
    #[error("document '{name}' in '{collection}' is missing {field}")]
    MissingField {
        /// Target collection.
        collection: String,
        /// Document name (may be empty when the name itself is missing).
        name: String,
        /// The missing field.
        field: &'static str,
    },

    /// A field is present on a kind that must not carry it.
    #[error("document '{name}' in '{collection}' must not carry {field}")]
    UnexpectedField {
        /// Target collection.
        collection: String,
        /// Document name.
        name: String,
        /// The unexpected field.
        field: &'static str,
    },

    /// A payload key is empty or contains the path separator.
    #[error("document '{name}' has invalid payload key '{key}'")]
    InvalidKey {
        /// Document name.
        name: String,
        /// The offending key.
        key: String,
    },
}

/// A batch violates a uniqueness or revision rule.
#[derive(Error, Debug)]
pub enum ConsistencyError {
    /// Two calibration revisions of one key claim the same first valid run.
    #[error("calibration '{name}' ({doc_type}) staged twice for run {run}")]
    DuplicateValidity {
        /// Calibration name.
        name: String,
        /// Calibration type.
        doc_type: String,
        /// The repeated first valid run.
        run: i64,
    },

    /// A status document would replace different content under the same key.
    #[error("status document '{name}' ({doc_type}) already exists with different content")]
    StatusConflict {
        /// Status document name.
        name: String,
        /// Status document type.
        doc_type: String,
    },
}

/// Journal lookup or lifecycle failure.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// No journal entry has this id.
    #[error("unknown transaction {id}")]
    Unknown {
        /// The requested id.
        id: TxnId,
    },

    /// The entry is not allowed to move to the requested state.
    #[error("transaction {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The transaction id.
        id: TxnId,
        /// Current status.
        from: TransactionStatus,
        /// Requested status.
        to: TransactionStatus,
    },

    /// A journal entry with this id already exists.
    #[error("transaction {id} is already journaled")]
    DuplicateId {
        /// The colliding id.
        id: TxnId,
    },
}

/// The resolver could not pick exactly one applicable revision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No revision applies to the requested field.
    #[error("no applicable {what} for '{name}'")]
    InsufficientData {
        /// What was being resolved (e.g. "geometry", "calibration NoiseRate").
        what: String,
        /// The record name.
        name: String,
    },

    /// More than one revision is equally applicable.
    #[error("{count} equally applicable revisions of {what} for '{name}'")]
    DuplicateData {
        /// What was being resolved.
        what: String,
        /// The record name.
        name: String,
        /// How many revisions tied.
        count: usize,
    },
}

/// Type alias for `Result<T, GcdError>`.
pub type Result<T> = std::result::Result<T, GcdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_errors_convert_and_display() {
        let err: GcdError = ConsistencyError::StatusConflict {
            name: "dom-settings".to_string(),
            doc_type: "DOMSettings".to_string(),
        }
        .into();
        assert!(matches!(err, GcdError::Consistency(_)));
        assert_eq!(
            err.to_string(),
            "consistency error: status document 'dom-settings' (DOMSettings) already exists with different content"
        );
    }

    #[test]
    fn test_transition_error_names_states() {
        let err = TransactionError::InvalidTransition {
            id: TxnId(4),
            from: TransactionStatus::RolledBack,
            to: TransactionStatus::Committed,
        };
        assert_eq!(
            err.to_string(),
            "transaction 4 cannot move from rolled-back to committed"
        );
    }
}
