//! # gcdstore
//!
//! Versioned document store for detector geometry, calibration and status.
//!
//! gcdstore keeps every revision of every configuration record ever
//! committed and answers "what was in effect for run N?" by resolution at
//! read time. Nothing is ever overwritten: a correction is a new document
//! from a later transaction, and a bad import is undone by rolling back its
//! transaction.
//!
//! ## Key Properties
//!
//! - Append-only collections; revisions are ordered by transaction id
//! - All-or-nothing batches: a commit that fails leaves nothing visible
//! - Every transaction journaled with who, where and how, including failures
//! - Concurrent importers get distinct, contiguous transaction ids
//! - Readers work on snapshots and never block on iteration
//!
//! ## Quick Start
//!
//! ```rust
//! use gcdstore::{Database, Document, Provenance, Resolver, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory(StoreConfig::default())?;
//!
//! // Import a batch in one transaction
//! let mut writer = db.begin_transaction(Provenance::from_env())?;
//! writer.insert("geometry", Document::geometry("21-30", "Module").with("string", 21).with("position", 30));
//! writer.insert("calibration", Document::calibration("21-30", "NoiseRate", 100).with("rate_hz", 812.5));
//! writer.commit()?;
//!
//! // A later correction for the same run range
//! let mut writer = db.begin_transaction(Provenance::from_env())?;
//! writer.insert("calibration", Document::calibration("21-30", "NoiseRate", 100).with("rate_hz", 790.0));
//! writer.commit()?;
//!
//! let resolver = Resolver::new(&db, 120)?;
//! let rate = resolver.effective_calibration("21-30", "NoiseRate", 120)?.expect("calibrated");
//! assert_eq!(rate.require_f64("rate_hz")?, 790.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Database`]: Top-level handle; owns collections, journal and id counter
//! - [`Writer`]: Stages one transaction's documents and commits them atomically
//! - [`Resolver`]: Effective geometry, calibration and status for a run
//! - [`Cursor`]: Lazy, restartable query result over a snapshot
//!
//! ## Modules
//!
//! - [`store`]: Database lifecycle, persistence, snapshots, rollback
//! - [`writer`]: Commit validation and batch rules
//! - [`transaction`]: Ids, journal entries and their lifecycle
//! - [`collection`]: Append-only document collections
//! - [`document`]: The document model and dedup keys
//! - [`value`]: Payload values
//! - [`predicate`]: Filter expressions
//! - [`pipeline`]: `Match`/`Sort`/`GroupLast` aggregation
//! - [`query`]: Query cursors
//! - [`resolver`]: Read-side resolution and the detector view
//! - [`diff`]: Field-by-field comparison of configurations
//! - [`schema`]: Store and collection configuration
//! - [`error`]: Error types

pub mod collection;
pub mod diff;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod predicate;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod transaction;
pub mod value;
pub mod writer;

// Re-export primary API types at crate root for convenience.
pub use document::{Document, DocumentKind, RunNumber};
pub use error::{GcdError, ResolveError, Result};
pub use predicate::Predicate;
pub use query::Cursor;
pub use resolver::{DetectorView, Resolver};
pub use schema::StoreConfig;
pub use store::{Database, Snapshot};
pub use transaction::{Provenance, TransactionStatus, TxnId};
pub use value::Value;
pub use writer::Writer;
