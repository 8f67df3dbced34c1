//! Integration tests for on-disk persistence.

use gcdstore::error::StoreError;
use gcdstore::schema::{CALIBRATION, GEOMETRY, STATUS};
use gcdstore::{
    Database, Document, GcdError, Predicate, Provenance, StoreConfig, TransactionStatus, TxnId,
};
use tempfile::tempdir;

#[test]
fn test_reopen_restores_documents_and_journal() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("gcd");

    let (committed, rolled_back) = {
        let db = Database::open(&store_path, StoreConfig::default()).unwrap();

        let mut writer = db.begin_transaction(Provenance::new("a", "h", "c")).unwrap();
        writer.insert(
            GEOMETRY,
            Document::geometry("21-30", "Module")
                .with("string", 21)
                .with("position", 30),
        );
        writer.insert(
            CALIBRATION,
            Document::calibration("21-30", "NoiseRate", 5).with("rate_hz", 800.0),
        );
        let committed = writer.commit().unwrap();

        let mut writer = db.begin_transaction(Provenance::new("b", "h", "c")).unwrap();
        writer.insert(STATUS, Document::status("hv", "DOMSettings").with("voltage", 1300));
        let rolled_back = writer.commit().unwrap();
        db.rollback(rolled_back).unwrap();

        (committed, rolled_back)
    };

    for file in ["meta.json", "journal.json", "geometry.json", "calibration.json", "status.json"] {
        assert!(store_path.join(file).exists(), "{file} missing");
    }

    let db = Database::open(&store_path, StoreConfig::default()).unwrap();
    assert_eq!(db.next_txn_id(), TxnId(2));
    assert_eq!(db.collection_counts()[GEOMETRY], 1);
    assert_eq!(db.collection_counts()[CALIBRATION], 1);
    assert_eq!(db.collection_counts()[STATUS], 0);

    let record = db.transaction(committed).unwrap();
    assert_eq!(record.status, TransactionStatus::Committed);
    assert_eq!(record.provenance.actor, "a");
    assert_eq!(record.affected[GEOMETRY], 1);
    assert_eq!(
        db.transaction(rolled_back).unwrap().status,
        TransactionStatus::RolledBack
    );

    let doc = db
        .find(CALIBRATION, Predicate::eq("name", "21-30"), 0)
        .unwrap()
        .next()
        .unwrap();
    assert_eq!(doc.txn_id, Some(committed));
    assert_eq!(doc.require_f64("rate_hz").unwrap(), 800.0);

    // Ids keep counting after reopen
    let writer = db.begin_transaction(Provenance::default()).unwrap();
    assert_eq!(writer.id(), TxnId(2));
}

#[test]
fn test_interrupted_transaction_is_rolled_back_on_open() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("gcd");

    {
        let db = Database::open(&store_path, StoreConfig::default()).unwrap();
        let writer = db.begin_transaction(Provenance::default()).unwrap();
        // Simulate a crash: the entry stays New on disk
        std::mem::forget(writer);
        assert_eq!(
            db.transaction(TxnId(0)).unwrap().status,
            TransactionStatus::New
        );
    }

    let db = Database::open(&store_path, StoreConfig::default()).unwrap();
    assert_eq!(
        db.transaction(TxnId(0)).unwrap().status,
        TransactionStatus::RolledBack
    );
    assert_eq!(db.next_txn_id(), TxnId(1));
}

#[test]
fn test_corrupted_journal_is_reported() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("gcd");
    drop(Database::open(&store_path, StoreConfig::default()).unwrap());

    std::fs::write(store_path.join("journal.json"), "{not json").unwrap();
    assert!(matches!(
        Database::open(&store_path, StoreConfig::default()),
        Err(GcdError::Store(StoreError::Serde { .. }))
    ));
}

#[test]
fn test_unwritable_batch_is_discarded() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("gcd");
    let blocker = store_path.join("geometry.json.tmp");

    let id = {
        let db = Database::open(&store_path, StoreConfig::default()).unwrap();
        let mut writer = db.begin_transaction(Provenance::default()).unwrap();
        writer.insert(GEOMETRY, Document::geometry("21-30", "Module"));
        let id = writer.id();

        // A directory where the temp file goes makes the collection write fail
        std::fs::create_dir(&blocker).unwrap();
        assert!(matches!(
            writer.commit(),
            Err(GcdError::Store(StoreError::Io { .. }))
        ));
        assert_eq!(db.collection_counts()[GEOMETRY], 0);
        assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::Error);
        id
    };

    std::fs::remove_dir(&blocker).unwrap();
    let db = Database::open(&store_path, StoreConfig::default()).unwrap();
    assert_eq!(db.collection_counts()[GEOMETRY], 0);
    assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::Error);

    let mut writer = db.begin_transaction(Provenance::default()).unwrap();
    writer.insert(GEOMETRY, Document::geometry("21-30", "Module"));
    writer.commit().unwrap();
    assert_eq!(db.collection_counts()[GEOMETRY], 1);
}

#[test]
fn test_failed_commit_reports_its_own_error_when_journal_is_unwritable() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("gcd");
    let db = Database::open(&store_path, StoreConfig::default()).unwrap();

    let mut writer = db.begin_transaction(Provenance::default()).unwrap();
    writer.insert(GEOMETRY, Document::calibration("21-30", "NoiseRate", 5));
    let id = writer.id();

    let blocker = store_path.join("journal.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(matches!(writer.commit(), Err(GcdError::Insert(_))));
    assert_eq!(db.transaction(id).unwrap().status, TransactionStatus::Error);
    assert_eq!(db.collection_counts()[GEOMETRY], 0);
    std::fs::remove_dir(&blocker).unwrap();
}
