//! Blob retrieval across hosts
//!
//! Resolves a blob through the metadata store, fetches enough shards of each
//! chunk from their hosts, decrypts them, and rebuilds the plaintext.
//!
//! Shards are requested in waves: first `m` shards, then one more for each
//! that failed, until `m` have arrived or no slot is left. A failing host
//! only costs the shards it was asked for. Every started fetch is awaited,
//! since abandoning one mid-exchange would leave its session unusable.

use crate::crypto::{ChunkKey, CIPHER_OVERHEAD};
use crate::error::{RenterError, Result};
use crate::host::{ContractEditor, HostInfo, HostSession, HostSessionConfig};
use crate::metadb::{display_key, BlobRecord, ChunkRecord, HostKey, MetaDb};
use crate::sharding::{shard_size, ErasureCoder};
use crate::SECTOR_SIZE;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reads blobs back from the hosts holding their shards.
pub struct Retriever<C> {
    metadb: Arc<dyn MetaDb>,
    coder: Box<dyn ErasureCoder>,
    sessions: HashMap<HostKey, Mutex<HostSession<C>>>,
}

impl<C: ContractEditor> Retriever<C> {
    /// A retriever with no host sessions yet.
    pub fn new(metadb: Arc<dyn MetaDb>, coder: Box<dyn ErasureCoder>) -> Self {
        Self {
            metadb,
            coder,
            sessions: HashMap::new(),
        }
    }

    /// Open a session with every host concurrently. Hosts that fail to
    /// connect are logged and left out.
    pub async fn connect(
        metadb: Arc<dyn MetaDb>,
        coder: Box<dyn ErasureCoder>,
        hosts: Vec<(HostInfo, C)>,
        config: HostSessionConfig,
    ) -> Self {
        let attempts = hosts.into_iter().map(|(host, contract)| {
            let config = config.clone();
            async move {
                let key = host.key;
                (key, HostSession::open(host, contract, config).await)
            }
        });

        let mut retriever = Self::new(metadb, coder);
        for (key, result) in join_all(attempts).await {
            match result {
                Ok(session) => retriever.add_session(session),
                Err(err) => warn!(host = %key, error = %err, "Could not open host session"),
            }
        }
        info!(hosts = retriever.sessions.len(), "Retriever connected");
        retriever
    }

    /// Use an already open session, replacing any for the same host.
    pub fn add_session(&mut self, session: HostSession<C>) {
        self.sessions.insert(session.host_key(), Mutex::new(session));
    }

    pub fn connected_hosts(&self) -> Vec<HostKey> {
        let mut hosts: Vec<HostKey> = self.sessions.keys().copied().collect();
        hosts.sort();
        hosts
    }

    /// Read a whole blob.
    pub async fn read_blob(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (blob, chunks) = self.resolve(key)?;
        let total = chunks.iter().map(|c| c.len).sum();
        self.read_chunks(&blob, &chunks, 0, total).await
    }

    /// Read `len` bytes of a blob starting at `offset`.
    pub async fn read_range(&self, key: &[u8], offset: u64, len: u64) -> Result<Vec<u8>> {
        let (blob, chunks) = self.resolve(key)?;
        self.read_chunks(&blob, &chunks, offset, len).await
    }

    /// Close every session.
    pub async fn close(&self) {
        for session in self.sessions.values() {
            session.lock().await.close().await;
        }
    }

    fn resolve(&self, key: &[u8]) -> Result<(BlobRecord, Vec<ChunkRecord>)> {
        let blob = self.metadb.get_blob(key)?;
        let chunks = blob
            .chunks
            .iter()
            .map(|&id| self.metadb.get_chunk(id))
            .collect::<Result<Vec<_>>>()?;
        Ok((blob, chunks))
    }

    async fn read_chunks(
        &self,
        blob: &BlobRecord,
        chunks: &[ChunkRecord],
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let total: u64 = chunks.iter().map(|c| c.len).sum();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= total)
            .ok_or(RenterError::InvalidRange {
                offset,
                length: len,
                limit: total,
            })?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut chunk_start = 0u64;
        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_end = chunk_start + chunk.len;
            if chunk_end > offset {
                let plaintext = self.read_chunk(blob, index, chunk).await?;
                let from = (offset.max(chunk_start) - chunk_start) as usize;
                let to = (end.min(chunk_end) - chunk_start) as usize;
                out.extend_from_slice(&plaintext[from..to]);
            }
            if chunk_end >= end {
                break;
            }
            chunk_start = chunk_end;
        }

        debug!(key = %display_key(&blob.key), offset, len, "Read blob range");
        Ok(out)
    }

    async fn read_chunk(
        &self,
        blob: &BlobRecord,
        index: usize,
        chunk: &ChunkRecord,
    ) -> Result<Vec<u8>> {
        let needed = chunk.min_shards as usize;
        let sealed_len = (shard_size(chunk.len, needed) + CIPHER_OVERHEAD) as u64;
        let key = blob.seed.derive_key(index as u64);
        let key = &key;

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; chunk.num_shards()];
        let mut candidates = chunk.set_slots();
        let mut retrieved = 0;

        while retrieved < needed {
            let wave: Vec<(usize, u64)> = candidates.by_ref().take(needed - retrieved).collect();
            if wave.is_empty() {
                break;
            }
            let fetches = wave.into_iter().map(|(slot, shard_id)| async move {
                (slot, self.fetch_shard(shard_id, sealed_len, key).await)
            });
            for (slot, result) in join_all(fetches).await {
                match result {
                    Ok(bytes) => {
                        shards[slot] = Some(bytes);
                        retrieved += 1;
                    }
                    Err(err) => {
                        warn!(
                            chunk = chunk.id,
                            slot,
                            host_fault = err.is_host_fault(),
                            error = %err,
                            "Shard retrieval failed"
                        )
                    }
                }
            }
        }

        if retrieved < needed {
            return Err(RenterError::ChunkUnavailable {
                chunk: chunk.id,
                needed,
                retrieved,
            });
        }
        self.coder.reconstruct(&mut shards, needed, chunk.len)
    }

    async fn fetch_shard(&self, shard_id: u64, len: u64, key: &ChunkKey) -> Result<Vec<u8>> {
        let shard = self.metadb.get_shard(shard_id)?;
        let session = self.sessions.get(&shard.host_key).ok_or_else(|| {
            RenterError::Connection(format!("no session with host {}", shard.host_key))
        })?;

        let sealed = {
            let mut session = session.lock().await;
            if shard.offset == 0 && len == SECTOR_SIZE as u64 {
                session
                    .retrieve_full_sector(&shard.sector_root)
                    .await?
                    .to_vec()
            } else {
                session
                    .retrieve_range(&shard.sector_root, shard.offset as u64, len)
                    .await?
                    .to_vec()
            }
        };
        key.decrypt(&shard.nonce, &sealed)
    }
}
