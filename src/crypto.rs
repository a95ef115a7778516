//! Sector Merkle roots and shard encryption
//!
//! ## Merkle root
//!
//! A sector is split into 64-byte segments. Leaves are
//! `SHA-256(0x00 || segment)`, interior nodes `SHA-256(0x01 || left || right)`.
//! An odd node at the end of a level is promoted unchanged.
//!
//! ## Shard keys
//!
//! Each blob carries a random 32-byte `KeySeed`. The key for chunk `i` is
//! `SHA-256("shard-renter/chunk-key" || seed || i as u64 LE)`, and every shard
//! of that chunk is sealed with XChaCha20-Poly1305 under its own random
//! 24-byte nonce. The 16-byte tag doubles as the integrity check for ranged
//! reads, which cannot be checked against a sector root.

use crate::error::{RenterError, Result};
use crate::metadb::SectorRoot;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Bytes per Merkle leaf.
pub const SEGMENT_SIZE: usize = 64;

/// Nonce length for shard encryption.
pub const NONCE_LEN: usize = 24;

/// Bytes the cipher adds to each shard.
pub const CIPHER_OVERHEAD: usize = 16;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const CHUNK_KEY_DOMAIN: &[u8] = b"shard-renter/chunk-key";

/// Compute the Merkle root of sector data.
pub fn sector_merkle_root(data: &[u8]) -> SectorRoot {
    let mut level: Vec<[u8; 32]> = data.chunks(SEGMENT_SIZE).map(leaf_hash).collect();
    if level.is_empty() {
        return SectorRoot(leaf_hash(&[]));
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => node_hash(left, right),
                _ => pair[0],
            })
            .collect();
    }
    SectorRoot(level[0])
}

fn leaf_hash(segment: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(segment);
    hasher.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Per-blob secret from which chunk keys are derived.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySeed([u8; 32]);

impl KeySeed {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self(seed)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key for the chunk at `chunk_index` within the blob.
    pub fn derive_key(&self, chunk_index: u64) -> ChunkKey {
        let mut hasher = Sha256::new();
        hasher.update(CHUNK_KEY_DOMAIN);
        hasher.update(self.0);
        hasher.update(chunk_index.to_le_bytes());
        ChunkKey(hasher.finalize().into())
    }
}

impl fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySeed(..)")
    }
}

/// Symmetric key for the shards of one chunk.
#[derive(Clone)]
pub struct ChunkKey([u8; 32]);

impl ChunkKey {
    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(&self.0.into())
    }

    /// Seal a shard. Output is `CIPHER_OVERHEAD` bytes longer than the input.
    pub fn encrypt(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| RenterError::Encoding("shard encryption failed".into()))
    }

    /// Open a shard; a tag mismatch means the bytes were altered.
    pub fn decrypt(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                RenterError::IntegrityViolation("shard failed authentication".into())
            })
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

/// Fresh random nonce for a shard.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
