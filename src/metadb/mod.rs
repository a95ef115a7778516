//! Metadata store for the blob → chunk → shard graph
//!
//! ## Model
//!
//! | Record  | Key             | Holds                                       |
//! |---------|-----------------|---------------------------------------------|
//! | Blob    | caller's bytes  | ordered chunk ids, key seed                 |
//! | Chunk   | id (from 1)     | `n` shard slots, `m`, plaintext length      |
//! | Shard   | id (from 1)     | host key, sector root, offset, nonce        |
//! | Meta    | caller's bytes  | opaque value                                |
//!
//! Every shard carries a reference count: the number of slots naming it,
//! summed over the chunk entries of all live blobs. Sectors whose shards all
//! sit at zero are reported by `unreferenced_sectors` for garbage collection.
//!
//! ## Backends
//!
//! - `MemoryMetaDb` - a mutex over vectors and maps; for tests and scratch use.
//! - `SledMetaDb` - one sled tree per record kind; each mutation commits as a
//!   single multi-tree transaction.
//!
//! `open_metadb` picks one from `Config`.

mod memory;
mod records;
mod refs;
mod sled_store;

pub use memory::MemoryMetaDb;
pub use records::{
    validate_chunk_params, BlobRecord, ChunkRecord, HostKey, SectorRoot, ShardRecord, MAX_SHARDS,
};
pub use sled_store::SledMetaDb;

pub(crate) use records::display_key;

use crate::config::{Config, MetaDbBackend};
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::info;

/// Storage for blobs, chunks, shards and auxiliary metadata.
///
/// Implementations serialize mutations and never expose a half-applied one.
pub trait MetaDb: Send + Sync {
    /// Install a blob. Fails with `DuplicateKey` if the key is live and with
    /// `KeyNotFound` if any chunk id is unknown.
    fn add_blob(&self, blob: &BlobRecord) -> Result<()>;

    fn get_blob(&self, key: &[u8]) -> Result<BlobRecord>;

    /// Remove a blob and release its references. Absent keys are a no-op.
    fn delete_blob(&self, key: &[u8]) -> Result<()>;

    /// Visit live blob keys in lexicographic byte order until `visit` breaks.
    fn for_each_blob(
        &self,
        visit: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>>;

    /// Allocate a chunk with `num_shards` empty slots.
    fn add_chunk(&self, min_shards: usize, num_shards: usize, len: u64) -> Result<ChunkRecord>;

    fn get_chunk(&self, id: u64) -> Result<ChunkRecord>;

    /// Point `slot` of a chunk at `shard_id` (`0` clears it), moving references.
    fn set_chunk_shard(&self, chunk_id: u64, slot: usize, shard_id: u64) -> Result<()>;

    fn add_shard(&self, shard: &ShardRecord) -> Result<u64>;

    fn get_shard(&self, id: u64) -> Result<ShardRecord>;

    /// Allocate every shard and a chunk filled with them, all or nothing.
    fn add_chunk_and_shards(
        &self,
        min_shards: usize,
        len: u64,
        shards: &[ShardRecord],
    ) -> Result<ChunkRecord>;

    /// Sectors, grouped by host, that no live blob needs any more.
    fn unreferenced_sectors(&self) -> Result<BTreeMap<HostKey, Vec<SectorRoot>>>;

    /// The maintained non-zero reference counts, by shard id.
    fn reference_counts(&self) -> Result<HashMap<u64, u64>>;

    fn add_metadata(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get_metadata(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Flush and release. Idempotent; later operations fail.
    fn close(&self) -> Result<()>;

    /// All live blob keys, in order.
    fn blob_keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let flow = self.for_each_blob(&mut |key| {
            keys.push(key.to_vec());
            ControlFlow::Continue(())
        })?;
        debug_assert!(flow.is_continue());
        Ok(keys)
    }
}

/// Open the backend selected by `config.metadb.backend`.
pub fn open_metadb(config: &Config) -> Result<Arc<dyn MetaDb>> {
    match config.metadb.backend {
        MetaDbBackend::Memory => {
            info!("Using in-memory metadata store");
            Ok(Arc::new(MemoryMetaDb::new()))
        }
        MetaDbBackend::Sled => {
            let db = SledMetaDb::open(config.metadata_db_path(), &config.metadb)?;
            Ok(Arc::new(db))
        }
    }
}

/// Recompute reference counts from the graph alone.
pub fn recompute_reference_counts(db: &dyn MetaDb) -> Result<HashMap<u64, u64>> {
    let mut counts: HashMap<u64, u64> = HashMap::new();
    let mut chunks: HashMap<u64, ChunkRecord> = HashMap::new();
    for key in db.blob_keys()? {
        let blob = db.get_blob(&key)?;
        for chunk_id in blob.chunks {
            if !chunks.contains_key(&chunk_id) {
                chunks.insert(chunk_id, db.get_chunk(chunk_id)?);
            }
            if let Some(chunk) = chunks.get(&chunk_id) {
                for (_, shard) in chunk.set_slots() {
                    *counts.entry(shard).or_default() += 1;
                }
            }
        }
    }
    Ok(counts)
}

/// A shard whose maintained count disagrees with the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefMismatch {
    pub shard_id: u64,
    pub stored: u64,
    pub expected: u64,
}

/// Compare maintained counts with recomputed ones. Empty means consistent.
///
/// Only meaningful while no other writer is mutating the store.
pub fn check_reference_counts(db: &dyn MetaDb) -> Result<Vec<RefMismatch>> {
    let stored = db.reference_counts()?;
    let expected = recompute_reference_counts(db)?;

    let mut ids: Vec<u64> = stored.keys().chain(expected.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    Ok(ids
        .into_iter()
        .filter_map(|shard_id| {
            let stored = stored.get(&shard_id).copied().unwrap_or(0);
            let expected = expected.get(&shard_id).copied().unwrap_or(0);
            (stored != expected).then_some(RefMismatch {
                shard_id,
                stored,
                expected,
            })
        })
        .collect())
}
