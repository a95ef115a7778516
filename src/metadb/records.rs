//! Blob, chunk and shard records
//!
//! These are plain values: the store hands out owned copies and keeps the
//! authoritative versions. Ids are store-local, start at 1, and `0` means
//! "unset" wherever a shard id appears in a chunk slot.

use crate::crypto::{KeySeed, CIPHER_OVERHEAD};
use crate::error::{RenterError, Result};
use crate::SECTOR_SIZE;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest number of shards a chunk may be coded into.
pub const MAX_SHARDS: usize = 255;

/// A host's ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey(pub [u8; 32]);

impl HostKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check a signature made by this host over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| RenterError::Protocol(format!("invalid host key {}: {}", self, e)))?;
        key.verify(message, signature)
            .map_err(|_| RenterError::Protocol(format!("bad signature from host {}", self)))
    }
}

impl From<VerifyingKey> for HostKey {
    fn from(key: VerifyingKey) -> Self {
        HostKey(key.to_bytes())
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", self.to_hex())
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostKey({}..)", &self.to_hex()[..16])
    }
}

/// Merkle root of a full sector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorRoot(pub [u8; 32]);

impl SectorRoot {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorRoot({}..)", &self.to_hex()[..16])
    }
}

/// Where one encrypted shard lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Host holding the sector
    pub host_key: HostKey,
    /// Merkle root of the sector
    pub sector_root: SectorRoot,
    /// Byte offset of the shard inside the sector
    pub offset: u32,
    /// Encryption nonce for this shard
    pub nonce: [u8; 24],
}

/// One erasure-coded unit of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u64,
    /// Shard id per slot; `0` marks an unset slot
    pub shards: Vec<u64>,
    /// Shards needed to reconstruct (`m`)
    pub min_shards: u8,
    /// Plaintext length in bytes
    pub len: u64,
}

impl ChunkRecord {
    /// Total shard slots (`n`).
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Slots with a shard assigned.
    pub fn set_slots(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.shards
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, id)| id != 0)
    }
}

/// A named, ordered list of chunks plus the seed its chunk keys derive from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub key: Vec<u8>,
    pub chunks: Vec<u64>,
    pub seed: KeySeed,
}

/// Check `(m, n, len)` for a new chunk and narrow the counts to their stored width.
pub fn validate_chunk_params(min_shards: usize, num_shards: usize, len: u64) -> Result<(u8, u8)> {
    if min_shards == 0 {
        return Err(RenterError::InvalidParameters(
            "chunk needs at least one required shard".into(),
        ));
    }
    if min_shards > num_shards {
        return Err(RenterError::InvalidParameters(format!(
            "min shards {} exceeds total shards {}",
            min_shards, num_shards
        )));
    }
    if num_shards > MAX_SHARDS {
        return Err(RenterError::InvalidParameters(format!(
            "{} shards exceeds the limit of {}",
            num_shards, MAX_SHARDS
        )));
    }
    // Every shard is sealed before placement, so it must leave room for the tag.
    let capacity = min_shards as u64 * (SECTOR_SIZE - CIPHER_OVERHEAD) as u64;
    if len > capacity {
        return Err(RenterError::InvalidParameters(format!(
            "chunk length {} does not fit in {} sealed sectors",
            len, min_shards
        )));
    }
    Ok((min_shards as u8, num_shards as u8))
}

/// Display form of a raw blob key for logs and errors.
pub(crate) fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => format!("{:?}", s),
        Err(_) => format!("0x{}", hex::encode(key)),
    }
}
