//! Erasure coding of chunks into shards
//!
//! A chunk of `len` bytes is padded to `m * shard_size(len, m)` and split
//! into `m` data shards; Reed-Solomon adds `n - m` parity shards. Any `m` of
//! the `n` shards rebuild the chunk. With `m == n` there is no parity and
//! the shards are plain stripes.

use crate::error::{RenterError, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

/// Bytes in each shard of a `len`-byte chunk split `m` ways.
pub fn shard_size(len: u64, min_shards: usize) -> usize {
    if min_shards == 0 {
        return 0;
    }
    len.div_ceil(min_shards as u64) as usize
}

/// Turns chunks into shards and back.
pub trait ErasureCoder: Send + Sync {
    /// Encode `data` into `num_shards` shards, any `min_shards` of which suffice.
    fn encode(&self, data: &[u8], min_shards: usize, num_shards: usize) -> Result<Vec<Vec<u8>>>;

    /// Rebuild the original `len` bytes. `shards` has one entry per slot,
    /// `None` for missing ones; at least `min_shards` must be present.
    fn reconstruct(
        &self,
        shards: &mut [Option<Vec<u8>>],
        min_shards: usize,
        len: u64,
    ) -> Result<Vec<u8>>;
}

/// Reed-Solomon over GF(2^8).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReedSolomonCoder;

impl ReedSolomonCoder {
    fn check(min_shards: usize, num_shards: usize) -> Result<()> {
        if min_shards == 0 || min_shards > num_shards || num_shards > 256 {
            return Err(RenterError::InvalidParameters(format!(
                "cannot code {} of {} shards",
                min_shards, num_shards
            )));
        }
        Ok(())
    }
}

impl ErasureCoder for ReedSolomonCoder {
    fn encode(&self, data: &[u8], min_shards: usize, num_shards: usize) -> Result<Vec<Vec<u8>>> {
        Self::check(min_shards, num_shards)?;
        let size = shard_size(data.len() as u64, min_shards);
        if size == 0 {
            return Ok(vec![Vec::new(); num_shards]);
        }

        // Pad data to a whole number of shards
        let mut padded = data.to_vec();
        padded.resize(size * min_shards, 0);

        let mut shards: Vec<Vec<u8>> = padded.chunks(size).map(|s| s.to_vec()).collect();
        if num_shards == min_shards {
            return Ok(shards);
        }

        shards.resize(num_shards, vec![0u8; size]);
        let rs = ReedSolomon::new(min_shards, num_shards - min_shards)
            .map_err(|e| RenterError::Erasure(format!("{:?}", e)))?;
        rs.encode(&mut shards)
            .map_err(|e| RenterError::Erasure(format!("{:?}", e)))?;

        debug!(len = data.len(), min_shards, num_shards, shard_size = size, "Encoded chunk");
        Ok(shards)
    }

    fn reconstruct(
        &self,
        shards: &mut [Option<Vec<u8>>],
        min_shards: usize,
        len: u64,
    ) -> Result<Vec<u8>> {
        let num_shards = shards.len();
        Self::check(min_shards, num_shards)?;
        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < min_shards {
            return Err(RenterError::Erasure(format!(
                "need {} shards, have {}",
                min_shards, present
            )));
        }

        let size = shard_size(len, min_shards);
        if size > 0 && num_shards > min_shards {
            let rs = ReedSolomon::new(min_shards, num_shards - min_shards)
                .map_err(|e| RenterError::Erasure(format!("{:?}", e)))?;
            rs.reconstruct_data(shards)
                .map_err(|e| RenterError::Erasure(format!("{:?}", e)))?;
        }

        let mut data = Vec::with_capacity(size * min_shards);
        for shard in shards.iter().take(min_shards) {
            match shard {
                Some(bytes) if bytes.len() == size => data.extend_from_slice(bytes),
                Some(bytes) => {
                    return Err(RenterError::Erasure(format!(
                        "shard of {} bytes, expected {}",
                        bytes.len(),
                        size
                    )))
                }
                None => return Err(RenterError::Erasure("data shard missing".into())),
            }
        }
        data.truncate(len as usize);
        Ok(data)
    }
}
