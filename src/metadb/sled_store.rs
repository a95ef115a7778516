//! sled-backed `MetaDb`
//!
//! ## Layout
//!
//! | Tree        | Key                  | Value                            |
//! |-------------|----------------------|----------------------------------|
//! | `blobs`     | blob key             | chunk ids + key seed             |
//! | `chunks`    | chunk id (8 byte BE) | `ChunkRecord`                    |
//! | `shards`    | shard id (8 byte BE) | `ShardRecord`                    |
//! | `meta`      | caller key           | caller value                     |
//! | `sequences` | namespace name       | last allocated id (8 byte BE)    |
//! | `schema`    | `format-version`     | store layout version (1 byte)    |
//!
//! Record values are `[version][MessagePack body]`. Big-endian ids keep the
//! trees in allocation order. `meta` belongs to callers alone.
//!
//! Reference counts are not stored. They are rebuilt from the graph when the
//! store opens and then maintained in memory; the writer mutex is held from
//! before a transaction starts until its count update is applied.
//!
//! `close` drops every handle to the database, releasing its file lock once
//! in-flight reads finish.

use super::records::{
    display_key, validate_chunk_params, BlobRecord, ChunkRecord, HostKey, SectorRoot, ShardRecord,
};
use super::refs::{RefIndex, UnreferencedScan};
use super::MetaDb;
use crate::config::MetaDbConfig;
use crate::crypto::KeySeed;
use crate::error::{RenterError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// Version byte in front of every record value.
const RECORD_VERSION: u8 = 1;

/// Store layout version, kept in the `schema` tree.
pub const STORE_FORMAT_VERSION: u8 = 1;
pub const FORMAT_VERSION_KEY: &[u8] = b"format-version";

const CHUNK_SEQUENCE: &[u8] = b"chunks";
const SHARD_SEQUENCE: &[u8] = b"shards";

type TxResult<T> = ConflictableTransactionResult<T, RenterError>;

/// Blob value; the key is the tree key.
#[derive(Serialize, Deserialize)]
struct StoredBlob {
    chunks: Vec<u64>,
    seed: KeySeed,
}

/// Handles into an open database.
#[derive(Clone)]
struct Trees {
    db: Db,
    blobs: Tree,
    chunks: Tree,
    shards: Tree,
    meta: Tree,
    sequences: Tree,
}

impl Trees {
    /// Create the trees if missing and check the recorded format version.
    fn ensure_schema(db: Db) -> Result<Self> {
        let schema = db.open_tree("schema")?;
        match schema.get(FORMAT_VERSION_KEY)? {
            Some(found) if &found[..] != [STORE_FORMAT_VERSION].as_slice() => {
                return Err(RenterError::IncompatibleFormat {
                    found: found.first().copied().unwrap_or(0),
                    expected: STORE_FORMAT_VERSION,
                });
            }
            Some(_) => {}
            None => {
                schema.insert(FORMAT_VERSION_KEY, &[STORE_FORMAT_VERSION][..])?;
            }
        }

        Ok(Self {
            blobs: db.open_tree("blobs")?,
            chunks: db.open_tree("chunks")?,
            shards: db.open_tree("shards")?,
            meta: db.open_tree("meta")?,
            sequences: db.open_tree("sequences")?,
            db,
        })
    }

    fn rebuild_refs(&self) -> Result<RefIndex> {
        let mut refs = RefIndex::default();
        let mut cache: HashMap<u64, ChunkRecord> = HashMap::new();
        for item in self.blobs.iter() {
            let (_, value) = item?;
            let blob: StoredBlob = decode(&value)?;
            let mut chunks = Vec::with_capacity(blob.chunks.len());
            for id in blob.chunks {
                let chunk = match cache.get(&id) {
                    Some(chunk) => chunk.clone(),
                    None => {
                        let chunk = self.read_chunk(id)?;
                        cache.insert(id, chunk.clone());
                        chunk
                    }
                };
                chunks.push(chunk);
            }
            refs.attach_blob(&chunks);
        }
        Ok(refs)
    }

    fn read_chunk(&self, id: u64) -> Result<ChunkRecord> {
        match self.chunks.get(id.to_be_bytes())? {
            Some(value) => decode(&value),
            None => Err(RenterError::KeyNotFound(format!("chunk {}", id))),
        }
    }
}

/// `MetaDb` persisted in a sled database.
pub struct SledMetaDb {
    /// `None` once closed
    trees: RwLock<Option<Trees>>,
    /// Writer mutex; also guards the derived reference counts
    refs: Mutex<RefIndex>,
}

impl SledMetaDb {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: &MetaDbConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(config.flush_every_ms)
            .open()?;

        let trees = Trees::ensure_schema(db)?;
        let refs = trees.rebuild_refs()?;

        info!(
            path = %path.as_ref().display(),
            blobs = trees.blobs.len(),
            chunks = trees.chunks.len(),
            shards = trees.shards.len(),
            referenced_shards = refs.counts().len(),
            "Opened metadata database"
        );
        Ok(Self {
            trees: RwLock::new(Some(trees)),
            refs: Mutex::new(refs),
        })
    }

    /// Handles for one operation; fails once the store is closed.
    fn handles(&self) -> Result<Trees> {
        self.trees
            .read()
            .map_err(|_| RenterError::StorageBackend("metadata handle lock poisoned".into()))?
            .clone()
            .ok_or_else(|| RenterError::StorageBackend("metadata store is closed".into()))
    }

    /// Take the writer mutex, then the handles.
    fn writer(&self) -> Result<(MutexGuard<'_, RefIndex>, Trees)> {
        let guard = self
            .refs
            .lock()
            .map_err(|_| RenterError::StorageBackend("metadata writer lock poisoned".into()))?;
        let trees = self.handles()?;
        Ok((guard, trees))
    }
}

impl MetaDb for SledMetaDb {
    fn add_blob(&self, blob: &BlobRecord) -> Result<()> {
        let (mut refs, trees) = self.writer()?;
        let value = encode(&StoredBlob {
            chunks: blob.chunks.clone(),
            seed: blob.seed,
        })?;

        let chunks = finish((&trees.blobs, &trees.chunks).transaction(
            |(blobs, chunks)| -> TxResult<Vec<ChunkRecord>> {
                if blobs.get(&blob.key)?.is_some() {
                    return abort(RenterError::DuplicateKey(display_key(&blob.key)));
                }
                let resolved = blob
                    .chunks
                    .iter()
                    .map(|&id| tx_read::<ChunkRecord>(chunks, id, "chunk"))
                    .collect::<TxResult<Vec<_>>>()?;
                blobs.insert(blob.key.as_slice(), value.as_slice())?;
                Ok(resolved)
            },
        ))?;

        refs.attach_blob(&chunks);
        debug!(key = %display_key(&blob.key), chunks = chunks.len(), "Added blob");
        Ok(())
    }

    fn get_blob(&self, key: &[u8]) -> Result<BlobRecord> {
        let value = self
            .handles()?
            .blobs
            .get(key)?
            .ok_or_else(|| RenterError::KeyNotFound(format!("blob {}", display_key(key))))?;
        let stored: StoredBlob = decode(&value)?;
        Ok(BlobRecord {
            key: key.to_vec(),
            chunks: stored.chunks,
            seed: stored.seed,
        })
    }

    fn delete_blob(&self, key: &[u8]) -> Result<()> {
        let (mut refs, trees) = self.writer()?;

        let removed = finish((&trees.blobs, &trees.chunks).transaction(
            |(blobs, chunks)| -> TxResult<Option<Vec<ChunkRecord>>> {
                let Some(value) = blobs.get(key)? else {
                    return Ok(None);
                };
                let blob: StoredBlob =
                    decode(&value).map_err(ConflictableTransactionError::Abort)?;
                let resolved = blob
                    .chunks
                    .iter()
                    .map(|&id| tx_read::<ChunkRecord>(chunks, id, "chunk"))
                    .collect::<TxResult<Vec<_>>>()?;
                blobs.remove(key)?;
                Ok(Some(resolved))
            },
        ))?;

        if let Some(chunks) = removed {
            refs.detach_blob(&chunks);
            debug!(key = %display_key(key), "Deleted blob");
        }
        Ok(())
    }

    fn for_each_blob(
        &self,
        visit: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        let blobs = self.handles()?.blobs;
        for key in blobs.iter().keys() {
            let key = key?;
            if visit(&key[..]).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn add_chunk(&self, min_shards: usize, num_shards: usize, len: u64) -> Result<ChunkRecord> {
        let (m, n) = validate_chunk_params(min_shards, num_shards, len)?;
        let (_writer, trees) = self.writer()?;

        finish((&trees.chunks, &trees.sequences).transaction(
            |(chunks, sequences)| -> TxResult<ChunkRecord> {
                let chunk = ChunkRecord {
                    id: next_id(sequences, CHUNK_SEQUENCE)?,
                    shards: vec![0; n as usize],
                    min_shards: m,
                    len,
                };
                tx_write(chunks, chunk.id, &chunk)?;
                Ok(chunk)
            },
        ))
    }

    fn get_chunk(&self, id: u64) -> Result<ChunkRecord> {
        self.handles()?.read_chunk(id)
    }

    fn set_chunk_shard(&self, chunk_id: u64, slot: usize, shard_id: u64) -> Result<()> {
        let (mut refs, trees) = self.writer()?;

        let old = finish((&trees.chunks, &trees.shards).transaction(
            |(chunks, shards)| -> TxResult<u64> {
                let mut chunk: ChunkRecord = tx_read(chunks, chunk_id, "chunk")?;
                if slot >= chunk.shards.len() {
                    return abort(RenterError::InvalidParameters(format!(
                        "slot {} out of range for chunk {} with {} shards",
                        slot,
                        chunk_id,
                        chunk.shards.len()
                    )));
                }
                if shard_id != 0 && shards.get(shard_id.to_be_bytes())?.is_none() {
                    return abort(RenterError::KeyNotFound(format!("shard {}", shard_id)));
                }
                let old = std::mem::replace(&mut chunk.shards[slot], shard_id);
                tx_write(chunks, chunk_id, &chunk)?;
                Ok(old)
            },
        ))?;

        refs.replace_slot(chunk_id, old, shard_id);
        Ok(())
    }

    fn add_shard(&self, shard: &ShardRecord) -> Result<u64> {
        let (_writer, trees) = self.writer()?;
        finish((&trees.shards, &trees.sequences).transaction(
            |(shards, sequences)| -> TxResult<u64> {
                let id = next_id(sequences, SHARD_SEQUENCE)?;
                tx_write(shards, id, shard)?;
                Ok(id)
            },
        ))
    }

    fn get_shard(&self, id: u64) -> Result<ShardRecord> {
        match self.handles()?.shards.get(id.to_be_bytes())? {
            Some(value) => decode(&value),
            None => Err(RenterError::KeyNotFound(format!("shard {}", id))),
        }
    }

    fn add_chunk_and_shards(
        &self,
        min_shards: usize,
        len: u64,
        shards: &[ShardRecord],
    ) -> Result<ChunkRecord> {
        let (m, _) = validate_chunk_params(min_shards, shards.len(), len)?;
        let (_writer, trees) = self.writer()?;

        let chunk = finish((&trees.chunks, &trees.shards, &trees.sequences).transaction(
            |(chunk_tree, shard_tree, sequences)| -> TxResult<ChunkRecord> {
                let mut ids = Vec::with_capacity(shards.len());
                for shard in shards {
                    let id = next_id(sequences, SHARD_SEQUENCE)?;
                    tx_write(shard_tree, id, shard)?;
                    ids.push(id);
                }
                let chunk = ChunkRecord {
                    id: next_id(sequences, CHUNK_SEQUENCE)?,
                    shards: ids,
                    min_shards: m,
                    len,
                };
                tx_write(chunk_tree, chunk.id, &chunk)?;
                Ok(chunk)
            },
        ))?;

        debug!(chunk = chunk.id, shards = shards.len(), "Added chunk with shards");
        Ok(chunk)
    }

    fn unreferenced_sectors(&self) -> Result<BTreeMap<HostKey, Vec<SectorRoot>>> {
        // Holding the writer keeps counts and shard records in step.
        let (refs, trees) = self.writer()?;
        let mut scan = UnreferencedScan::default();
        for item in trees.shards.iter() {
            let (key, value) = item?;
            let shard: ShardRecord = decode(&value)?;
            scan.observe(&shard, refs.count(decode_id(&key)?));
        }
        Ok(scan.finish())
    }

    fn reference_counts(&self) -> Result<HashMap<u64, u64>> {
        Ok(self.writer()?.0.counts())
    }

    fn add_metadata(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.handles()?.meta.insert(key, value)?;
        Ok(())
    }

    fn get_metadata(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.handles()?
            .meta
            .get(key)?
            .map(|value| value.to_vec())
            .ok_or_else(|| RenterError::KeyNotFound(format!("metadata {}", display_key(key))))
    }

    fn close(&self) -> Result<()> {
        let _writer = self
            .refs
            .lock()
            .map_err(|_| RenterError::StorageBackend("metadata writer lock poisoned".into()))?;
        let trees = self
            .trees
            .write()
            .map_err(|_| RenterError::StorageBackend("metadata handle lock poisoned".into()))?
            .take();
        let Some(trees) = trees else {
            return Ok(());
        };
        let flushed = trees.db.flush()?;
        info!(bytes = flushed, "Closed metadata database");
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = vec![RECORD_VERSION];
    rmp_serde::encode::write(&mut out, value)?;
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&RECORD_VERSION, body)) => Ok(rmp_serde::from_slice(body)?),
        Some((&found, _)) => Err(RenterError::IncompatibleFormat {
            found,
            expected: RECORD_VERSION,
        }),
        None => Err(RenterError::Encoding("empty record".into())),
    }
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RenterError::Encoding(format!("id key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Allocate the next id of a namespace inside a transaction.
fn next_id(sequences: &TransactionalTree, name: &'static [u8]) -> TxResult<u64> {
    let current = match sequences.get(name)? {
        Some(bytes) => decode_id(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => 0,
    };
    let next = current + 1;
    sequences.insert(name, &next.to_be_bytes()[..])?;
    Ok(next)
}

fn tx_read<T: DeserializeOwned>(tree: &TransactionalTree, id: u64, what: &str) -> TxResult<T> {
    match tree.get(id.to_be_bytes())? {
        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort),
        None => abort(RenterError::KeyNotFound(format!("{} {}", what, id))),
    }
}

fn tx_write<T: Serialize>(tree: &TransactionalTree, id: u64, value: &T) -> TxResult<()> {
    let bytes = encode(value).map_err(ConflictableTransactionError::Abort)?;
    tree.insert(&id.to_be_bytes()[..], bytes)?;
    Ok(())
}

fn finish<T>(result: TransactionResult<T, RenterError>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => RenterError::Database(e),
    })
}
