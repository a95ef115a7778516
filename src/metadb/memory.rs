//! In-memory `MetaDb`
//!
//! All state sits behind one mutex, so every operation is trivially atomic.
//! Nothing survives a restart.

use super::records::{
    display_key, validate_chunk_params, BlobRecord, ChunkRecord, HostKey, SectorRoot, ShardRecord,
};
use super::refs::{RefIndex, UnreferencedScan};
use super::MetaDb;
use crate::error::{RenterError, Result};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// shard id `i` lives at index `i - 1`
    shards: Vec<ShardRecord>,
    /// chunk id `i` lives at index `i - 1`
    chunks: Vec<ChunkRecord>,
    blobs: BTreeMap<Vec<u8>, BlobRecord>,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
    refs: RefIndex,
    closed: bool,
}

impl Inner {
    fn chunk(&self, id: u64) -> Result<&ChunkRecord> {
        index(id)
            .and_then(|i| self.chunks.get(i))
            .ok_or_else(|| RenterError::KeyNotFound(format!("chunk {}", id)))
    }

    fn shard(&self, id: u64) -> Result<&ShardRecord> {
        index(id)
            .and_then(|i| self.shards.get(i))
            .ok_or_else(|| RenterError::KeyNotFound(format!("shard {}", id)))
    }

    fn resolve_chunks(&self, ids: &[u64]) -> Result<Vec<ChunkRecord>> {
        ids.iter().map(|&id| self.chunk(id).cloned()).collect()
    }

    fn push_shard(&mut self, shard: ShardRecord) -> u64 {
        self.shards.push(shard);
        self.shards.len() as u64
    }
}

fn index(id: u64) -> Option<usize> {
    id.checked_sub(1).map(|i| i as usize)
}

/// `MetaDb` kept entirely in process memory.
#[derive(Default)]
pub struct MemoryMetaDb {
    inner: Mutex<Inner>,
}

impl MemoryMetaDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| RenterError::StorageBackend("metadata lock poisoned".into()))?;
        if inner.closed {
            return Err(RenterError::StorageBackend("metadata store is closed".into()));
        }
        Ok(inner)
    }
}

impl MetaDb for MemoryMetaDb {
    fn add_blob(&self, blob: &BlobRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.blobs.contains_key(&blob.key) {
            return Err(RenterError::DuplicateKey(display_key(&blob.key)));
        }
        let chunks = inner.resolve_chunks(&blob.chunks)?;
        inner.blobs.insert(blob.key.clone(), blob.clone());
        inner.refs.attach_blob(&chunks);
        debug!(key = %display_key(&blob.key), chunks = chunks.len(), "Added blob");
        Ok(())
    }

    fn get_blob(&self, key: &[u8]) -> Result<BlobRecord> {
        self.lock()?
            .blobs
            .get(key)
            .cloned()
            .ok_or_else(|| RenterError::KeyNotFound(format!("blob {}", display_key(key))))
    }

    fn delete_blob(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(blob) = inner.blobs.remove(key) else {
            return Ok(());
        };
        let chunks = inner.resolve_chunks(&blob.chunks)?;
        inner.refs.detach_blob(&chunks);
        debug!(key = %display_key(key), "Deleted blob");
        Ok(())
    }

    fn for_each_blob(
        &self,
        visit: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        // Snapshot so the visitor may call back into the store.
        let keys: Vec<Vec<u8>> = self.lock()?.blobs.keys().cloned().collect();
        for key in &keys {
            if visit(key).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn add_chunk(&self, min_shards: usize, num_shards: usize, len: u64) -> Result<ChunkRecord> {
        let (m, n) = validate_chunk_params(min_shards, num_shards, len)?;
        let mut inner = self.lock()?;
        let chunk = ChunkRecord {
            id: inner.chunks.len() as u64 + 1,
            shards: vec![0; n as usize],
            min_shards: m,
            len,
        };
        inner.chunks.push(chunk.clone());
        Ok(chunk)
    }

    fn get_chunk(&self, id: u64) -> Result<ChunkRecord> {
        self.lock()?.chunk(id).cloned()
    }

    fn set_chunk_shard(&self, chunk_id: u64, slot: usize, shard_id: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let slots = inner.chunk(chunk_id)?.shards.len();
        if slot >= slots {
            return Err(RenterError::InvalidParameters(format!(
                "slot {} out of range for chunk {} with {} shards",
                slot, chunk_id, slots
            )));
        }
        if shard_id != 0 {
            inner.shard(shard_id)?;
        }
        let Some(chunk) = index(chunk_id).and_then(|i| inner.chunks.get_mut(i)) else {
            return Err(RenterError::KeyNotFound(format!("chunk {}", chunk_id)));
        };
        let old = std::mem::replace(&mut chunk.shards[slot], shard_id);
        inner.refs.replace_slot(chunk_id, old, shard_id);
        Ok(())
    }

    fn add_shard(&self, shard: &ShardRecord) -> Result<u64> {
        Ok(self.lock()?.push_shard(shard.clone()))
    }

    fn get_shard(&self, id: u64) -> Result<ShardRecord> {
        self.lock()?.shard(id).cloned()
    }

    fn add_chunk_and_shards(
        &self,
        min_shards: usize,
        len: u64,
        shards: &[ShardRecord],
    ) -> Result<ChunkRecord> {
        let (m, _) = validate_chunk_params(min_shards, shards.len(), len)?;
        let mut inner = self.lock()?;
        let ids = shards
            .iter()
            .map(|shard| inner.push_shard(shard.clone()))
            .collect();
        let chunk = ChunkRecord {
            id: inner.chunks.len() as u64 + 1,
            shards: ids,
            min_shards: m,
            len,
        };
        inner.chunks.push(chunk.clone());
        Ok(chunk)
    }

    fn unreferenced_sectors(&self) -> Result<BTreeMap<HostKey, Vec<SectorRoot>>> {
        let inner = self.lock()?;
        let mut scan = UnreferencedScan::default();
        for (i, shard) in inner.shards.iter().enumerate() {
            scan.observe(shard, inner.refs.count(i as u64 + 1));
        }
        Ok(scan.finish())
    }

    fn reference_counts(&self) -> Result<HashMap<u64, u64>> {
        Ok(self.lock()?.refs.counts())
    }

    fn add_metadata(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()?.meta.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get_metadata(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.lock()?
            .meta
            .get(key)
            .cloned()
            .ok_or_else(|| RenterError::KeyNotFound(format!("metadata {}", display_key(key))))
    }

    fn close(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| RenterError::StorageBackend("metadata lock poisoned".into()))?;
        inner.closed = true;
        Ok(())
    }
}
