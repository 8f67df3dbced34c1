//! Read side: the effective detector configuration for a run.
//!
//! A [`Resolver`] works on one [`Snapshot`] of the store, so every answer it
//! gives is consistent with every other. It resolves three things:
//!
//! - **Geometry**: the revision of a name committed by the greatest
//!   transaction.
//! - **Calibration**: per `(name, type)`, the revision with the greatest first
//!   valid run not after the target run; ties go to the later transaction.
//! - **Status**: a named configuration document listing, per object type, the
//!   status documents it references.
//!
//! On top of these it builds a [`DetectorView`] with lookups by device id,
//! by detector position, and by name. Problems with individual records
//! are collected in [`DetectorView::issues`] rather than failing the build.
//!
//! # Example
//!
//! ```rust
//! use gcdstore::{Database, Document, Provenance, Resolver, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory(StoreConfig::default())?;
//! let mut writer = db.begin_transaction(Provenance::default())?;
//! writer.insert(
//!     "geometry",
//!     Document::geometry("21-30", "Module").with("string", 21).with("position", 30),
//! );
//! writer.insert(
//!     "calibration",
//!     Document::calibration("21-30", "NoiseRate", 100).with("rate_hz", 812.5),
//! );
//! writer.commit()?;
//!
//! let resolver = Resolver::new(&db, 150)?;
//! let module = resolver.view().by_position(21, 30, None).expect("module");
//! assert_eq!(module.name, "21-30");
//! assert_eq!(resolver.view().calibrations_for("21-30").len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::document::{
    Document, FIELD_NAME, FIELD_TXN_ID, FIELD_TYPE, FIELD_VALID_FROM_RUN, RunNumber,
};
use crate::error::{ResolveError, Result};
use crate::pipeline::{self, SortKey, Stage};
use crate::predicate::Predicate;
use crate::schema::{CALIBRATION, GEOMETRY, STATUS};
use crate::store::{Database, Snapshot};

/// Document type of status configuration documents.
pub const CONFIGURATION_TYPE: &str = "Configuration";
/// Geometry document type of in-ice and surface modules.
pub const MODULE_TYPE: &str = "Module";
/// Geometry document type of surface tanks.
pub const TANK_TYPE: &str = "Tank";

/// Resolves effective documents against one snapshot.
#[derive(Debug)]
pub struct Resolver {
    snapshot: Snapshot,
    run: RunNumber,
    view: DetectorView,
}

impl Resolver {
    /// Snapshots `db` and builds the detector view for `run`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownCollection`](crate::error::CollectionError)
    /// if the store lacks the geometry or calibration collection.
    pub fn new(db: &Database, run: RunNumber) -> Result<Self> {
        Self::from_snapshot(db.snapshot(), run)
    }

    /// Builds a resolver over an existing snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`Resolver::new`].
    pub fn from_snapshot(snapshot: Snapshot, run: RunNumber) -> Result<Self> {
        let view = DetectorView::build(&snapshot, run)?;
        tracing::debug!(
            run,
            modules = view.geometry.len(),
            issues = view.issues.len(),
            "built detector view"
        );
        Ok(Self {
            snapshot,
            run,
            view,
        })
    }

    /// The run this resolver's view was built for.
    pub fn run(&self) -> RunNumber {
        self.run
    }

    /// The snapshot being resolved.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The cached detector view.
    pub fn view(&self) -> &DetectorView {
        &self.view
    }

    /// The latest geometry revision of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InsufficientData`] if no revision exists.
    pub fn latest_geometry(&self, name: &str) -> Result<Arc<Document>> {
        let stages = [
            Stage::Match(Predicate::eq(FIELD_NAME, name)),
            Stage::Sort(vec![SortKey::asc(FIELD_TXN_ID)]),
            Stage::GroupLast(vec![FIELD_NAME.to_string()]),
        ];
        self.snapshot
            .aggregate(GEOMETRY, &stages)?
            .next()
            .ok_or_else(|| {
                ResolveError::InsufficientData {
                    what: "geometry".to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// The calibration revision of `(name, doc_type)` in effect at `run`.
    ///
    /// Returns `None` when `run` precedes every revision.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::DuplicateData`] if two revisions share both
    /// first valid run and transaction.
    pub fn effective_calibration(
        &self,
        name: &str,
        doc_type: &str,
        run: RunNumber,
    ) -> Result<Option<Arc<Document>>> {
        let candidates = self
            .snapshot
            .find(
                CALIBRATION,
                Predicate::and([
                    Predicate::eq(FIELD_NAME, name),
                    Predicate::eq(FIELD_TYPE, doc_type),
                ]),
                0,
            )?
            .collect();
        Ok(effective_revision(candidates, run)?)
    }

    /// The status documents of `object_type` referenced by `configuration`.
    ///
    /// The configuration document's payload entry named `object_type` lists
    /// the referenced document names. Content-identical duplicates collapse
    /// into one.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::InsufficientData`] if the configuration, its list, or
    ///   a referenced document is missing
    /// - [`ResolveError::DuplicateData`] if a name matches differing documents
    pub fn status_documents(
        &self,
        configuration: &str,
        object_type: &str,
    ) -> Result<Vec<Arc<Document>>> {
        let config = self.unique_status(configuration, CONFIGURATION_TYPE)?;
        let names = config
            .get(object_type)
            .and_then(|v| v.as_array())
            .ok_or_else(|| ResolveError::InsufficientData {
                what: format!("{CONFIGURATION_TYPE} list '{object_type}'"),
                name: configuration.to_string(),
            })?;

        let mut resolved = Vec::with_capacity(names.len());
        for entry in names {
            let name = entry.as_str().ok_or_else(|| ResolveError::InsufficientData {
                what: format!("{CONFIGURATION_TYPE} entry of '{object_type}'"),
                name: configuration.to_string(),
            })?;
            resolved.push(self.unique_status(name, object_type)?);
        }
        Ok(resolved)
    }

    fn unique_status(&self, name: &str, doc_type: &str) -> Result<Arc<Document>> {
        let matches: Vec<Arc<Document>> = self
            .snapshot
            .find(
                STATUS,
                Predicate::and([
                    Predicate::eq(FIELD_NAME, name),
                    Predicate::eq(FIELD_TYPE, doc_type),
                ]),
                0,
            )?
            .collect();
        let mut distinct: Vec<Arc<Document>> = Vec::new();
        for doc in matches {
            if !distinct.iter().any(|d| d.same_content(&doc)) {
                distinct.push(doc);
            }
        }
        match distinct.len() {
            0 => Err(ResolveError::InsufficientData {
                what: format!("status {doc_type}"),
                name: name.to_string(),
            }
            .into()),
            1 => Ok(distinct.remove(0)),
            count => Err(ResolveError::DuplicateData {
                what: format!("status {doc_type}"),
                name: name.to_string(),
                count,
            }
            .into()),
        }
    }
}

/// Picks the revision in effect at `run` among revisions of one key.
fn effective_revision(
    candidates: Vec<Arc<Document>>,
    run: RunNumber,
) -> std::result::Result<Option<Arc<Document>>, ResolveError> {
    let stages = [
        Stage::Match(Predicate::lte(FIELD_VALID_FROM_RUN, run)),
        Stage::Sort(vec![
            SortKey::asc(FIELD_TXN_ID),
            SortKey::asc(FIELD_VALID_FROM_RUN),
        ]),
    ];
    let ordered = pipeline::run(&stages, candidates);
    let Some(winner) = ordered.last() else {
        return Ok(None);
    };
    let tied = ordered
        .iter()
        .filter(|d| d.valid_from_run == winner.valid_from_run && d.txn_id == winner.txn_id)
        .count();
    if tied > 1 {
        return Err(ResolveError::DuplicateData {
            what: format!("calibration {}", winner.doc_type),
            name: winner.name.clone(),
            count: tied,
        });
    }
    Ok(Some(Arc::clone(winner)))
}

/// Detector position of a module: string, position, and optional PMT index.
pub type PositionKey = (i64, i64, Option<i64>);

/// Effective geometry and calibration at one run, indexed for lookup.
#[derive(Debug, Default)]
pub struct DetectorView {
    run: RunNumber,
    geometry: BTreeMap<String, Arc<Document>>,
    calibrations: BTreeMap<String, Vec<Arc<Document>>>,
    device_ids: HashMap<i64, String>,
    positions: HashMap<PositionKey, String>,
    tanks: HashMap<String, (i64, String)>,
    issues: Vec<ResolveError>,
}

impl DetectorView {
    fn build(snapshot: &Snapshot, run: RunNumber) -> Result<Self> {
        let mut view = Self {
            run,
            ..Self::default()
        };
        view.load_geometry(snapshot.documents(GEOMETRY)?);
        view.load_calibration(snapshot.documents(CALIBRATION)?);
        Ok(view)
    }

    fn load_geometry(&mut self, docs: &[Arc<Document>]) {
        let ordered = pipeline::run(
            &[Stage::Sort(vec![SortKey::asc(FIELD_TXN_ID)])],
            docs.to_vec(),
        );
        // Later revisions overwrite earlier ones; within one transaction the
        // later-staged revision wins.
        for doc in ordered {
            if let Some(previous) = self.geometry.get(&doc.name)
                && previous.txn_id == doc.txn_id
                && !previous.same_content(&doc)
            {
                tracing::debug!(
                    name = %doc.name,
                    txn = ?doc.txn_id,
                    "geometry revised twice in one transaction"
                );
            }
            self.geometry.insert(doc.name.clone(), doc);
        }

        let latest: Vec<Arc<Document>> = self.geometry.values().cloned().collect();
        for doc in latest {
            match doc.doc_type.as_str() {
                MODULE_TYPE => self.index_module(&doc),
                TANK_TYPE => self.index_tank(&doc),
                _ => {}
            }
        }
    }

    fn index_module(&mut self, doc: &Document) {
        let position = doc
            .require_i64("string")
            .and_then(|string| Ok((string, doc.require_i64("position")?)));
        let (string, position) = match position {
            Ok(pair) => pair,
            Err(issue) => {
                self.issues.push(issue);
                return;
            }
        };
        let key = (string, position, doc.get("pmt").and_then(|v| v.as_i64()));
        if self.positions.insert(key, doc.name.clone()).is_some() {
            self.issues.push(ResolveError::DuplicateData {
                what: format!("module at {string}-{position}"),
                name: doc.name.clone(),
                count: 2,
            });
        }
        if let Some(device_id) = doc.get("device_id").and_then(|v| v.as_i64())
            && self.device_ids.insert(device_id, doc.name.clone()).is_some()
        {
            self.issues.push(ResolveError::DuplicateData {
                what: format!("device id {device_id:x}"),
                name: doc.name.clone(),
                count: 2,
            });
        }
    }

    fn index_tank(&mut self, doc: &Document) {
        let located = doc
            .require_i64("string")
            .and_then(|string| Ok((string, doc.require_str("label")?.to_string())));
        let (string, label) = match located {
            Ok(pair) => pair,
            Err(issue) => {
                self.issues.push(issue);
                return;
            }
        };
        let Some(doms) = doc.get("doms").and_then(|v| v.as_array()) else {
            self.issues.push(ResolveError::InsufficientData {
                what: "Tank field 'doms'".to_string(),
                name: doc.name.clone(),
            });
            return;
        };
        for dom in doms.iter().filter_map(|v| v.as_str()) {
            self.tanks
                .insert(dom.to_string(), (string, label.clone()));
        }
    }

    fn load_calibration(&mut self, docs: &[Arc<Document>]) {
        let mut by_key: BTreeMap<(String, String), Vec<Arc<Document>>> = BTreeMap::new();
        for doc in docs {
            by_key
                .entry((doc.name.clone(), doc.doc_type.clone()))
                .or_default()
                .push(Arc::clone(doc));
        }
        for ((name, _), revisions) in by_key {
            match effective_revision(revisions, self.run) {
                Ok(Some(doc)) => self.calibrations.entry(name).or_default().push(doc),
                Ok(None) => {}
                Err(issue) => self.issues.push(issue),
            }
        }
    }

    /// The run this view describes.
    pub fn run(&self) -> RunNumber {
        self.run
    }

    /// Latest geometry documents by name.
    pub fn geometry(&self) -> &BTreeMap<String, Arc<Document>> {
        &self.geometry
    }

    /// Latest geometry of `name`.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Document>> {
        self.geometry.get(name)
    }

    /// Module with hardware id `device_id`.
    pub fn by_device_id(&self, device_id: i64) -> Option<&Arc<Document>> {
        self.device_ids.get(&device_id).and_then(|n| self.by_name(n))
    }

    /// Module at `(string, position, pmt)`.
    pub fn by_position(&self, string: i64, position: i64, pmt: Option<i64>) -> Option<&Arc<Document>> {
        self.positions
            .get(&(string, position, pmt))
            .and_then(|n| self.by_name(n))
    }

    /// String number and label of the tank housing module `name`.
    pub fn tank_of(&self, name: &str) -> Option<(i64, &str)> {
        self.tanks
            .get(name)
            .map(|(string, label)| (*string, label.as_str()))
    }

    /// Calibration documents in effect for `name`, one per type, ordered by type.
    pub fn calibrations_for(&self, name: &str) -> &[Arc<Document>] {
        self.calibrations.get(name).map_or(&[], Vec::as_slice)
    }

    /// Problems found while building the view.
    pub fn issues(&self) -> &[ResolveError] {
        &self.issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GcdError;
    use crate::schema::StoreConfig;
    use crate::transaction::Provenance;
    use crate::value::Value;

    fn commit(db: &Database, docs: Vec<(&str, Document)>) {
        let mut writer = db.begin_transaction(Provenance::default()).unwrap();
        for (collection, doc) in docs {
            writer.insert(collection, doc);
        }
        writer.commit().unwrap();
    }

    fn module(name: &str, string: i64, position: i64) -> Document {
        Document::geometry(name, MODULE_TYPE)
            .with("string", string)
            .with("position", position)
    }

    #[test]
    fn test_latest_geometry_prefers_later_transaction() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(&db, vec![(GEOMETRY, module("a", 1, 1))]);
        commit(&db, vec![(GEOMETRY, module("b", 2, 1))]);
        commit(&db, vec![(GEOMETRY, module("a", 1, 2))]);

        let resolver = Resolver::new(&db, 0).unwrap();
        let a = resolver.latest_geometry("a").unwrap();
        assert_eq!(a.get("position"), Some(&Value::Int(2)));
        assert!(matches!(
            resolver.latest_geometry("zz"),
            Err(GcdError::Resolve(ResolveError::InsufficientData { .. }))
        ));
    }

    #[test]
    fn test_calibration_tie_on_run_goes_to_later_transaction() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(&db, vec![(CALIBRATION, Document::calibration("a", "Gain", 10).with("g", 1.0))]);
        commit(&db, vec![(CALIBRATION, Document::calibration("a", "Gain", 20).with("g", 2.0))]);
        commit(&db, vec![(CALIBRATION, Document::calibration("a", "Gain", 10).with("g", 3.0))]);

        let resolver = Resolver::new(&db, 0).unwrap();
        let at = |run| {
            resolver
                .effective_calibration("a", "Gain", run)
                .unwrap()
                .and_then(|d| d.get("g").and_then(Value::as_f64))
        };
        assert_eq!(at(5), None);
        assert_eq!(at(10), Some(3.0));
        assert_eq!(at(19), Some(3.0));
        assert_eq!(at(25), Some(2.0));
    }

    #[test]
    fn test_effective_revision_reports_exact_ties() {
        let mut first = Document::calibration("a", "Gain", 1);
        first.txn_id = Some(crate::transaction::TxnId(4));
        let second = first.clone().with("g", 2.0);
        let err = effective_revision(vec![Arc::new(first), Arc::new(second)], 3).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateData { count: 2, .. }));
    }

    #[test]
    fn test_status_documents_follow_configuration() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(
            &db,
            vec![
                (
                    STATUS,
                    Document::status("physics", CONFIGURATION_TYPE)
                        .with("DOMSettings", vec![Value::from("hv-a"), Value::from("hv-b")]),
                ),
                (STATUS, Document::status("hv-a", "DOMSettings").with("voltage", 1300)),
                (STATUS, Document::status("hv-b", "DOMSettings").with("voltage", 1250)),
            ],
        );
        let resolver = Resolver::new(&db, 0).unwrap();
        let docs = resolver.status_documents("physics", "DOMSettings").unwrap();
        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["hv-a", "hv-b"]);

        assert!(matches!(
            resolver.status_documents("physics", "TriggerSettings"),
            Err(GcdError::Resolve(ResolveError::InsufficientData { .. }))
        ));
        assert!(matches!(
            resolver.status_documents("missing", "DOMSettings"),
            Err(GcdError::Resolve(ResolveError::InsufficientData { .. }))
        ));
    }

    #[test]
    fn test_status_reference_to_missing_document() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(
            &db,
            vec![(
                STATUS,
                Document::status("physics", CONFIGURATION_TYPE)
                    .with("DOMSettings", vec![Value::from("hv-a")]),
            )],
        );
        let resolver = Resolver::new(&db, 0).unwrap();
        let err = resolver.status_documents("physics", "DOMSettings").unwrap_err();
        assert_eq!(err.to_string(), "resolve error: no applicable status DOMSettings for 'hv-a'");
    }

    #[test]
    fn test_view_indices() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(
            &db,
            vec![
                (GEOMETRY, module("21-30", 21, 30).with("device_id", 0x1234_i64)),
                (GEOMETRY, module("21-61", 21, 61).with("pmt", 0)),
                (GEOMETRY, module("21-62", 21, 61).with("pmt", 1)),
                (
                    GEOMETRY,
                    Document::geometry("21A", TANK_TYPE)
                        .with("string", 21)
                        .with("label", "A")
                        .with("doms", vec![Value::from("21-61"), Value::from("21-62")]),
                ),
                (CALIBRATION, Document::calibration("21-30", "NoiseRate", 100).with("rate_hz", 800.0)),
                (CALIBRATION, Document::calibration("21-30", "Gain", 200).with("gain", 1e7)),
            ],
        );

        let view = Resolver::new(&db, 150).unwrap().view;
        assert_eq!(view.run(), 150);
        assert_eq!(view.by_device_id(0x1234).map(|d| d.name.as_str()), Some("21-30"));
        assert_eq!(view.by_position(21, 61, Some(1)).map(|d| d.name.as_str()), Some("21-62"));
        assert!(view.by_position(21, 61, None).is_none());
        assert_eq!(view.tank_of("21-61"), Some((21, "A")));
        assert_eq!(view.tank_of("21-30"), None);

        let calibrations: Vec<_> = view
            .calibrations_for("21-30")
            .iter()
            .map(|d| d.doc_type.as_str())
            .collect();
        assert_eq!(calibrations, vec!["NoiseRate"]);
        assert!(view.issues().is_empty());
    }

    #[test]
    fn test_view_collects_issues() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(
            &db,
            vec![
                (GEOMETRY, Document::geometry("no-position", MODULE_TYPE).with("string", 1)),
                (GEOMETRY, module("x", 5, 5)),
                (GEOMETRY, module("y", 5, 5)),
                (GEOMETRY, Document::geometry("tank", TANK_TYPE).with("string", 5)),
            ],
        );
        let view = Resolver::new(&db, 0).unwrap().view;
        assert_eq!(view.geometry().len(), 4);
        assert_eq!(view.issues().len(), 3);
        assert!(view.by_name("no-position").is_some());
    }

    #[test]
    fn test_view_takes_last_staged_geometry_without_issue() {
        let db = Database::in_memory(StoreConfig::default()).unwrap();
        commit(&db, vec![(GEOMETRY, module("a", 1, 1)), (GEOMETRY, module("a", 1, 2))]);

        let view = Resolver::new(&db, 0).unwrap().view;
        assert!(view.issues().is_empty(), "unexpected {:?}", view.issues());
        assert_eq!(view.geometry().len(), 1);
        assert!(view.by_position(1, 1, None).is_none());
        assert_eq!(view.by_position(1, 2, None).map(|d| d.name.as_str()), Some("a"));
    }
}
