//! Reference counting shared by both backends
//!
//! `refcount(s)` counts, over every live blob and every chunk entry of that
//! blob, the slots naming shard `s`. A chunk listed twice in one blob counts
//! twice. Shard id `0` marks an empty slot and is never counted.
//!
//! The index also tracks how many live blob entries name each chunk, so a
//! slot replacement can move exactly that many references.

use super::records::{ChunkRecord, HostKey, SectorRoot, ShardRecord};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default, Clone)]
pub(crate) struct RefIndex {
    /// shard id -> live references (zero entries removed)
    shards: HashMap<u64, u64>,
    /// chunk id -> live blob entries naming it (zero entries removed)
    chunks: HashMap<u64, u64>,
}

impl RefIndex {
    /// Count the references of a newly installed blob. `chunks` is the blob's
    /// chunk list resolved in order, duplicates included.
    pub fn attach_blob(&mut self, chunks: &[ChunkRecord]) {
        for chunk in chunks {
            *self.chunks.entry(chunk.id).or_default() += 1;
            for (_, shard) in chunk.set_slots() {
                *self.shards.entry(shard).or_default() += 1;
            }
        }
    }

    /// Reverse of `attach_blob` for a removed blob.
    pub fn detach_blob(&mut self, chunks: &[ChunkRecord]) {
        for chunk in chunks {
            decrement(&mut self.chunks, chunk.id, 1);
            for (_, shard) in chunk.set_slots() {
                decrement(&mut self.shards, shard, 1);
            }
        }
    }

    /// Move the references of one chunk slot from `old` to `new`.
    pub fn replace_slot(&mut self, chunk_id: u64, old: u64, new: u64) {
        let entries = self.chunk_refs(chunk_id);
        if entries == 0 || old == new {
            return;
        }
        if old != 0 {
            decrement(&mut self.shards, old, entries);
        }
        if new != 0 {
            *self.shards.entry(new).or_default() += entries;
        }
    }

    pub fn chunk_refs(&self, chunk_id: u64) -> u64 {
        self.chunks.get(&chunk_id).copied().unwrap_or(0)
    }

    pub fn count(&self, shard_id: u64) -> u64 {
        self.shards.get(&shard_id).copied().unwrap_or(0)
    }

    /// Non-zero shard counts.
    pub fn counts(&self) -> HashMap<u64, u64> {
        self.shards.clone()
    }
}

fn decrement(map: &mut HashMap<u64, u64>, id: u64, by: u64) {
    if let Some(count) = map.get_mut(&id) {
        debug_assert!(*count >= by, "reference count for {} would go negative", id);
        *count = count.saturating_sub(by);
        if *count == 0 {
            map.remove(&id);
        }
    }
}

/// Collects the (host, root) pairs whose every shard record is unreferenced.
#[derive(Debug, Default)]
pub(crate) struct UnreferencedScan {
    /// (host, root) -> whether any shard naming it is still referenced
    sectors: BTreeMap<(HostKey, SectorRoot), bool>,
}

impl UnreferencedScan {
    pub fn observe(&mut self, shard: &ShardRecord, refcount: u64) {
        let referenced = self
            .sectors
            .entry((shard.host_key, shard.sector_root))
            .or_insert(false);
        *referenced |= refcount > 0;
    }

    /// Roots come out sorted and deduplicated because the map is ordered.
    pub fn finish(self) -> BTreeMap<HostKey, Vec<SectorRoot>> {
        let mut out: BTreeMap<HostKey, Vec<SectorRoot>> = BTreeMap::new();
        for ((host, root), referenced) in self.sectors {
            if !referenced {
                out.entry(host).or_default().push(root);
            }
        }
        out
    }
}
