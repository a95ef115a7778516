//! shard-renter admin tool
//!
//! Inspects and maintains a renter's metadata store.
//!
//! ## Usage
//!
//! ```bash
//! # List blob keys
//! shard-renter blobs
//!
//! # Show a blob's chunks and shard locations as JSON
//! shard-renter show photos/2024/beach.jpg
//!
//! # Sectors no live blob needs, grouped by host
//! shard-renter unreferenced
//!
//! # Check reference counts against the blob graph
//! shard-renter fsck
//!
//! # Auxiliary metadata
//! shard-renter meta set last-gc 2024-06-01
//! shard-renter meta get last-gc
//!
//! # Use a different store
//! shard-renter --storage-dir /data/renter blobs
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use shard_renter::metadb::{check_reference_counts, MetaDb};
use shard_renter::{open_metadb, Config, MetaDbBackend};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shard-renter")]
#[command(about = "Inspect and maintain a renter metadata store")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SHARD_RENTER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "SHARD_RENTER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Metadata backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Memory,
    Sled,
}

impl From<Backend> for MetaDbBackend {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Memory => MetaDbBackend::Memory,
            Backend::Sled => MetaDbBackend::Sled,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List blob keys in order
    Blobs,
    /// Show a blob with its chunks and shards
    Show { key: String },
    /// Delete a blob, releasing its shard references
    Delete { key: String },
    /// Report sectors no live blob references
    Unreferenced,
    /// Recompute reference counts and compare
    Fsck,
    /// Auxiliary metadata
    Meta {
        #[command(subcommand)]
        action: MetaAction,
    },
}

#[derive(Subcommand, Debug)]
enum MetaAction {
    Get { key: String },
    Set { key: String, value: String },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("shard_renter=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default(Config::default().config_path())?,
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(backend) = args.backend {
        config.metadb.backend = backend.into();
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        backend = ?config.metadb.backend,
        "Opening metadata store"
    );
    let db = open_metadb(&config).context("opening metadata store")?;

    let result = run(db.as_ref(), args.command);
    if let Err(e) = db.close() {
        error!(error = %e, "Failed to close metadata store");
    }
    result
}

fn run(db: &dyn MetaDb, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Blobs => {
            for key in db.blob_keys()? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Command::Show { key } => {
            println!("{}", serde_json::to_string_pretty(&describe_blob(db, key.as_bytes())?)?);
        }
        Command::Delete { key } => {
            db.get_blob(key.as_bytes())?;
            db.delete_blob(key.as_bytes())?;
            info!(key = %key, "Deleted blob");
        }
        Command::Unreferenced => {
            let report: serde_json::Map<String, serde_json::Value> = db
                .unreferenced_sectors()?
                .into_iter()
                .map(|(host, roots)| {
                    let roots: Vec<String> = roots.iter().map(|r| r.to_hex()).collect();
                    (host.to_hex(), json!(roots))
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Fsck => {
            let mismatches = check_reference_counts(db)?;
            if !mismatches.is_empty() {
                for m in &mismatches {
                    error!(
                        shard = m.shard_id,
                        stored = m.stored,
                        expected = m.expected,
                        "Reference count mismatch"
                    );
                }
                bail!("{} shard reference counts are wrong", mismatches.len());
            }
            info!("Reference counts consistent");
        }
        Command::Meta { action } => match action {
            MetaAction::Get { key } => {
                let value = db.get_metadata(key.as_bytes())?;
                println!("{}", String::from_utf8_lossy(&value));
            }
            MetaAction::Set { key, value } => {
                db.add_metadata(key.as_bytes(), value.as_bytes())?;
            }
        },
    }
    Ok(())
}

fn describe_blob(db: &dyn MetaDb, key: &[u8]) -> anyhow::Result<serde_json::Value> {
    let blob = db.get_blob(key)?;
    let mut chunks = Vec::with_capacity(blob.chunks.len());
    for chunk_id in &blob.chunks {
        let chunk = db.get_chunk(*chunk_id)?;
        let mut shards = Vec::with_capacity(chunk.shards.len());
        for (slot, shard_id) in chunk.shards.iter().enumerate() {
            if *shard_id == 0 {
                shards.push(json!({ "slot": slot, "shard": null }));
                continue;
            }
            let shard = db.get_shard(*shard_id)?;
            shards.push(json!({
                "slot": slot,
                "shard": shard_id,
                "host": shard.host_key.to_hex(),
                "sector_root": shard.sector_root.to_hex(),
                "offset": shard.offset,
            }));
        }
        chunks.push(json!({
            "id": chunk.id,
            "min_shards": chunk.min_shards,
            "len": chunk.len,
            "shards": shards,
        }));
    }

    Ok(json!({
        "key": String::from_utf8_lossy(&blob.key),
        "chunks": chunks,
    }))
}
