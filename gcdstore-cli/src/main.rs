//! CLI for the gcdstore versioned document store.
//!
//! Provides commands for inspecting stores, importing documents, resolving
//! the configuration in effect for a run, undoing imports, and comparing
//! detector-status configurations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use gcdstore::diff::{self, DEFAULT_TOLERANCE};
use gcdstore::{
    Database, Document, DocumentKind, Provenance, Resolver, RunNumber, StoreConfig, TxnId, Value,
};
use tracing_subscriber::EnvFilter;

/// gcdstore: versioned geometry, calibration and detector-status store CLI.
#[derive(Parser)]
#[command(name = "gcdstore", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display collections, document counts, and a journal summary.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// List every transaction in the journal.
    Log {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Commit a JSON array of documents in one transaction.
    Import {
        /// Path to the store directory (created if missing).
        store_path: PathBuf,

        /// JSON file holding an array of documents.
        file: PathBuf,

        /// Collection to insert into.
        #[arg(long)]
        collection: String,
    },

    /// Show the geometry and calibration in effect for a run.
    Resolve {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Run number to resolve for.
        #[arg(long)]
        run: RunNumber,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Undo every document written by a transaction.
    Rollback {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Transaction id.
        txn: u64,
    },

    /// Compare the status documents two configurations reference.
    Diff {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Name of the first configuration.
        config_a: String,

        /// Name of the second configuration.
        config_b: String,

        /// Object type to compare (e.g. "DOMSettings").
        #[arg(long)]
        object_type: String,

        /// Relative float tolerance.
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f64,
    },
}

/// Output format for resolution results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable listing.
    Text,
    /// JSON object.
    Json,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path),
        Commands::Log { store_path } => cmd_log(&store_path),
        Commands::Import {
            store_path,
            file,
            collection,
        } => cmd_import(&store_path, &file, &collection),
        Commands::Resolve {
            store_path,
            run,
            format,
        } => cmd_resolve(&store_path, run, &format),
        Commands::Rollback { store_path, txn } => cmd_rollback(&store_path, TxnId(txn)),
        Commands::Diff {
            store_path,
            config_a,
            config_b,
            object_type,
            tolerance,
        } => cmd_diff(&store_path, &config_a, &config_b, &object_type, tolerance),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens an existing store with the configuration it was created with.
fn open_existing(store_path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !store_path.join("meta.json").exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    let config = Database::stored_config(store_path)?;
    Ok(Database::open(store_path, config)?)
}

/// Implements `gcdstore info <store_path>`.
fn cmd_info(store_path: &Path) -> CliResult {
    let db = open_existing(store_path)?;
    let counts = db.collection_counts();

    println!("Store: {}", store_path.display());
    println!();
    println!("Collections: {}", db.config().collections.len());
    for collection in &db.config().collections {
        let count = counts.get(&collection.name).copied().unwrap_or(0);
        println!("  {} ({}): {count} documents", collection.name, collection.kind);
        for index in &collection.unique {
            println!("    unique: {}", index.fields.join(", "));
        }
        println!("    Hash: {:016x}", collection.stable_hash());
    }

    let records = db.transactions();
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        *by_status.entry(record.status.to_string()).or_default() += 1;
    }
    println!();
    println!("Transactions: {}", records.len());
    for (status, count) in by_status {
        println!("  {status}: {count}");
    }
    println!("Next transaction id: {}", db.next_txn_id());
    Ok(())
}

/// Implements `gcdstore log <store_path>`.
fn cmd_log(store_path: &Path) -> CliResult {
    let db = open_existing(store_path)?;
    println!("id,status,actor,host,created_unix_s,affected,cmdline");
    for record in db.transactions() {
        let created_s = record.created_at_ns / 1_000_000_000;
        let affected = record
            .affected
            .iter()
            .map(|(name, count)| format!("{name}={count}"))
            .collect::<Vec<_>>()
            .join(";");
        println!(
            "{},{},{},{},{created_s},{affected},{:?}",
            record.id, record.status, record.provenance.actor, record.provenance.host, record.provenance.cmdline
        );
    }
    Ok(())
}

/// Implements `gcdstore import <store_path> <file> --collection <name>`.
fn cmd_import(store_path: &Path, file: &Path, collection: &str) -> CliResult {
    let config = if store_path.join("meta.json").exists() {
        Database::stored_config(store_path)?
    } else {
        StoreConfig::default()
    };
    let kind = config
        .collection(collection)
        .map(|c| c.kind)
        .ok_or_else(|| format!("Unknown collection '{collection}'"))?;
    let db = Database::open(store_path, config)?;

    let data = std::fs::read_to_string(file)?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&data)?;

    let mut writer = db.begin_transaction(Provenance::from_env())?;
    for (i, entry) in entries.into_iter().enumerate() {
        let doc = document_from_json(entry, kind).map_err(|e| format!("entry {i}: {e}"))?;
        writer.insert(collection, doc);
    }
    let staged = writer.staged_len();
    let id = writer.commit()?;

    let affected = db
        .transaction(id)
        .and_then(|r| r.affected.get(collection).copied())
        .unwrap_or(0);
    println!("Committed transaction {id}: {affected} of {staged} documents stored in '{collection}'");
    Ok(())
}

/// Builds a document from a plain JSON object:
/// `{"name", "type", "kind"?, "valid_from_run"?, "payload"?}`.
fn document_from_json(
    entry: serde_json::Value,
    default_kind: DocumentKind,
) -> Result<Document, Box<dyn std::error::Error>> {
    let serde_json::Value::Object(mut object) = entry else {
        return Err("expected a JSON object".into());
    };
    let text = |object: &serde_json::Map<String, serde_json::Value>, key: &str| {
        object
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("missing string field '{key}'"))
    };
    let name = text(&object, "name")?;
    let doc_type = text(&object, "type")?;
    let kind = match object.get("kind") {
        Some(kind) => serde_json::from_value(kind.clone())?,
        None => default_kind,
    };

    let mut doc = Document::new(name, kind, doc_type);
    if let Some(run) = object.get("valid_from_run") {
        doc.valid_from_run = Some(run.as_i64().ok_or("'valid_from_run' must be an integer")?);
    }
    match object.remove("payload").map(Value::from_json) {
        Some(Value::Map(payload)) => doc.payload = payload,
        Some(_) => return Err("'payload' must be an object".into()),
        None => {}
    }
    Ok(doc)
}

/// Implements `gcdstore resolve <store_path> --run N`.
fn cmd_resolve(store_path: &Path, run: RunNumber, format: &OutputFormat) -> CliResult {
    let db = open_existing(store_path)?;
    let resolver = Resolver::new(&db, run)?;
    let view = resolver.view();

    match format {
        OutputFormat::Text => {
            println!("# run={run}, geometry={}, issues={}", view.geometry().len(), view.issues().len());
            for (name, doc) in view.geometry() {
                println!("{name} [{}] txn={}", doc.doc_type, txn_label(doc));
                for calibration in view.calibrations_for(name) {
                    println!(
                        "  {} from run {} txn={}",
                        calibration.doc_type,
                        calibration.valid_from_run.unwrap_or_default(),
                        txn_label(calibration)
                    );
                }
                if let Some((string, label)) = view.tank_of(name) {
                    println!("  tank {string}{label}");
                }
            }
            for issue in view.issues() {
                println!("! {issue}");
            }
        }
        OutputFormat::Json => {
            let geometry: serde_json::Map<String, serde_json::Value> = view
                .geometry()
                .iter()
                .map(|(name, doc)| {
                    let calibrations: serde_json::Map<String, serde_json::Value> = view
                        .calibrations_for(name)
                        .iter()
                        .map(|c| (c.doc_type.clone(), document_json(c)))
                        .collect();
                    let mut entry = document_json(doc);
                    entry["calibration"] = serde_json::Value::Object(calibrations);
                    (name.clone(), entry)
                })
                .collect();
            let output = serde_json::json!({
                "run": run,
                "geometry": geometry,
                "issues": view.issues().iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn txn_label(doc: &Document) -> String {
    doc.txn_id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn document_json(doc: &Arc<Document>) -> serde_json::Value {
    serde_json::json!({
        "type": doc.doc_type,
        "txn_id": doc.txn_id,
        "valid_from_run": doc.valid_from_run,
        "payload": Value::Map(doc.payload.clone()).to_json(),
    })
}

/// Implements `gcdstore rollback <store_path> <txn>`.
fn cmd_rollback(store_path: &Path, txn: TxnId) -> CliResult {
    let db = open_existing(store_path)?;
    let summary = db.rollback(txn)?;
    if summary.previous == summary.status {
        println!("Transaction {txn} is {}; nothing to do", summary.status);
        return Ok(());
    }
    println!("Transaction {txn}: {} -> {}", summary.previous, summary.status);
    for (collection, count) in &summary.removed {
        println!("  removed {count} from '{collection}'");
    }
    Ok(())
}

/// Implements `gcdstore diff <store_path> <config_a> <config_b> --object-type T`.
fn cmd_diff(
    store_path: &Path,
    config_a: &str,
    config_b: &str,
    object_type: &str,
    tolerance: f64,
) -> CliResult {
    let db = open_existing(store_path)?;
    let resolver = Resolver::new(&db, 0)?;
    let left = resolver.status_documents(config_a, object_type)?;
    let right = resolver.status_documents(config_b, object_type)?;

    let pairs = diff::compare_lists(&left, &right, tolerance);
    if pairs.is_empty() {
        println!("{config_a} and {config_b} agree on {} {object_type} documents", left.len());
        return Ok(());
    }
    for pair in &pairs {
        let side = |name: &Option<String>| name.clone().unwrap_or_else(|| "<none>".to_string());
        println!("{} <-> {}", side(&pair.left), side(&pair.right));
        for difference in &pair.differences {
            println!("  {difference}");
        }
    }
    println!("{} differing {object_type} pair(s)", pairs.len());
    Ok(())
}
