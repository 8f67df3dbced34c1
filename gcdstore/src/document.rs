//! Documents: the immutable records kept by the store.
//!
//! A [`Document`] is a named, typed record with a flat key/value payload
//! (values may nest) plus metadata assigned by the store: the id of the
//! transaction that committed it and, for calibrations, the first run the
//! revision applies to.
//!
//! # Field paths
//!
//! Predicates, sorts and groupings address document fields by path:
//!
//! | Path              | Field                                  |
//! |-------------------|----------------------------------------|
//! | `name`            | [`Document::name`]                     |
//! | `kind`            | [`Document::kind`] as a string         |
//! | `type`            | [`Document::doc_type`]                 |
//! | `txn_id`          | [`Document::txn_id`] as an int         |
//! | `valid_from_run`  | [`Document::valid_from_run`]           |
//! | `payload.<a.b>`   | nested payload lookup                  |

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::transaction::TxnId;
use crate::value::{PATH_SEPARATOR, Value};

/// Run number as assigned by the data acquisition system.
pub type RunNumber = i64;

/// Field path of the document name.
pub const FIELD_NAME: &str = "name";
/// Field path of the document kind.
pub const FIELD_KIND: &str = "kind";
/// Field path of the document sub-type.
pub const FIELD_TYPE: &str = "type";
/// Field path of the committing transaction id.
pub const FIELD_TXN_ID: &str = "txn_id";
/// Field path of the first valid run.
pub const FIELD_VALID_FROM_RUN: &str = "valid_from_run";
/// Prefix of payload field paths.
pub const FIELD_PAYLOAD: &str = "payload";

/// The three families of detector-configuration records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Detector geometry. Latest revision wins.
    Geometry,
    /// Calibration constants. Revisions carry a first valid run.
    Calibration,
    /// Detector-status configuration. Identity is structural.
    Status,
}

impl DocumentKind {
    /// Lowercase name used in field values, file names and messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Geometry => "geometry",
            Self::Calibration => "calibration",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The field combination identifying one logical record across revisions.
///
/// Geometry records are keyed by name alone; calibration and status records
/// by name and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    /// Record name.
    pub name: String,
    /// Record type, absent for geometry.
    pub doc_type: Option<String>,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.doc_type {
            Some(doc_type) => write!(f, "{} ({doc_type})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One immutable configuration record.
///
/// Documents are built client-side with the constructors below, staged on a
/// [`Writer`](crate::writer::Writer), and become shared, read-only
/// `Arc<Document>`s once committed.
///
/// # Example
///
/// ```rust
/// use gcdstore::Document;
///
/// let rate = Document::calibration("21-30", "NoiseRate", 120_000)
///     .with("rate_hz", 812.5)
///     .with("quality", "good");
/// assert_eq!(rate.get("rate_hz").and_then(|v| v.as_f64()), Some(812.5));
/// assert_eq!(rate.valid_from_run, Some(120_000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Record name (e.g. a module key `"21-30"` or a configuration name).
    pub name: String,
    /// Record family.
    pub kind: DocumentKind,
    /// Sub-kind tag (e.g. `"NoiseRate"`, `"DOMSettings"`, `"Module"`).
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Key/value payload.
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    /// Committing transaction, assigned when the document is staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<TxnId>,
    /// First run this revision applies to. Calibration only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from_run: Option<RunNumber>,
}

impl Document {
    /// Creates an empty document of the given kind.
    pub fn new(name: impl Into<String>, kind: DocumentKind, doc_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            doc_type: doc_type.into(),
            payload: BTreeMap::new(),
            txn_id: None,
            valid_from_run: None,
        }
    }

    /// Creates a geometry document.
    pub fn geometry(name: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self::new(name, DocumentKind::Geometry, doc_type)
    }

    /// Creates a calibration document valid from `valid_from_run` onwards.
    pub fn calibration(
        name: impl Into<String>,
        doc_type: impl Into<String>,
        valid_from_run: RunNumber,
    ) -> Self {
        let mut doc = Self::new(name, DocumentKind::Calibration, doc_type);
        doc.valid_from_run = Some(valid_from_run);
        doc
    }

    /// Creates a detector-status document.
    pub fn status(name: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self::new(name, DocumentKind::Status, doc_type)
    }

    /// Adds or replaces one payload entry (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Returns a top-level payload entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Returns a payload entry by dotted path (`gain.high`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let (head, rest) = match path.split_once(PATH_SEPARATOR) {
            Some((head, rest)) => (head, rest),
            None => (path, ""),
        };
        self.payload.get(head)?.get_path(rest)
    }

    /// Returns a payload integer, or `InsufficientData` naming what was missing.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InsufficientData`] if the entry is absent or not an int.
    pub fn require_i64(&self, key: &str) -> std::result::Result<i64, ResolveError> {
        self.get_path(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.missing(key))
    }

    /// Returns a payload number as `f64`, or `InsufficientData`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InsufficientData`] if the entry is absent or not numeric.
    pub fn require_f64(&self, key: &str) -> std::result::Result<f64, ResolveError> {
        self.get_path(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.missing(key))
    }

    /// Returns a payload string, or `InsufficientData`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InsufficientData`] if the entry is absent or not a string.
    pub fn require_str(&self, key: &str) -> std::result::Result<&str, ResolveError> {
        self.get_path(key)
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing(key))
    }

    fn missing(&self, key: &str) -> ResolveError {
        ResolveError::InsufficientData {
            what: format!("{} field '{key}'", self.doc_type),
            name: self.name.clone(),
        }
    }

    /// Looks up a field by path, including store metadata (see module docs).
    pub fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            FIELD_NAME => Some(Cow::Owned(Value::String(self.name.clone()))),
            FIELD_KIND => Some(Cow::Owned(Value::from(self.kind.as_str()))),
            FIELD_TYPE => Some(Cow::Owned(Value::String(self.doc_type.clone()))),
            FIELD_TXN_ID => self.txn_id.map(|id| Cow::Owned(Value::Int(id.as_i64()))),
            FIELD_VALID_FROM_RUN => self.valid_from_run.map(|run| Cow::Owned(Value::Int(run))),
            FIELD_PAYLOAD => Some(Cow::Owned(Value::Map(self.payload.clone()))),
            _ => {
                let rest = path
                    .strip_prefix(FIELD_PAYLOAD)?
                    .strip_prefix(PATH_SEPARATOR)?;
                self.get_path(rest).map(Cow::Borrowed)
            }
        }
    }

    /// Returns the dedup key for this document's kind.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            name: self.name.clone(),
            doc_type: match self.kind {
                DocumentKind::Geometry => None,
                DocumentKind::Calibration | DocumentKind::Status => Some(self.doc_type.clone()),
            },
        }
    }

    /// Canonical bytes of everything that makes up the record's content:
    /// kind, name, type, validity and payload. Store metadata is excluded.
    fn content_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.kind.as_str().as_bytes());
        Value::String(self.name.clone()).encode_canonical(&mut out);
        Value::String(self.doc_type.clone()).encode_canonical(&mut out);
        self.valid_from_run
            .map_or(Value::Null, Value::Int)
            .encode_canonical(&mut out);
        Value::Map(self.payload.clone()).encode_canonical(&mut out);
        out
    }

    /// Hash of the record content, independent of which transaction stored it.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.content_bytes().hash(&mut hasher);
        hasher.finish()
    }

    /// Whether two documents carry identical content.
    pub fn same_content(&self, other: &Document) -> bool {
        self.content_hash() == other.content_hash() && self.content_bytes() == other.content_bytes()
    }
}
