//! Host wire protocol
//!
//! Single responsibility: message types and their byte encoding. No I/O.
//!
//! Every message is framed as `[len: u64 LE][MessagePack body]`. A sector is
//! sent as a bare frame `[total: u64][count: u64][payload: u64][payload bytes]`,
//! all little-endian, where `total` covers the two trailing header words plus
//! the payload.
//!
//! ## Sequence
//!
//! ```text
//! renter                              host
//!   │── Handshake(Download, revision) ──▶│
//!   │◀──────────── HandshakeResponse ────│
//!   │                                     │   per retrieval:
//!   │── Settings ────────────────────────▶│
//!   │◀──────────────────── HostSettings ──│
//!   │── Download(root, offset, len) ─────▶│
//!   │── Revision(proposal) ──────────────▶│
//!   │◀────────────────── RevisionResponse │
//!   │◀────────────────────── sector frame │
//!   │                                     │
//!   │── Goodbye ─────────────────────────▶│
//! ```

use super::contract::{ContractRevision, Currency, SignedRevision};
use crate::error::{RenterError, Result};
use crate::metadb::SectorRoot;
use crate::SECTOR_SIZE;
use ed25519_dalek::Signature;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Length prefix of every message frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// `[total][count][payload]` preceding sector bytes.
pub const SECTOR_HEADER_LEN: usize = 24;

/// Operation a connection is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub rpc: RpcKind,
    pub revision: SignedRevision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeResponse {
    Accepted,
    Rejected(String),
}

/// Messages the renter sends inside an established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RenterMessage {
    Settings,
    Download(DownloadAction),
    Revision(RevisionProposal),
    Goodbye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAction {
    pub root: SectorRoot,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionProposal {
    pub revision: ContractRevision,
    pub renter_signature: Signature,
}

/// Host terms, fetched before every download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Price per downloaded byte
    pub download_price: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionResponse {
    /// Countersigned; the host keeps serving
    Accept(Signature),
    /// Countersigned; the host ends its loop after sending the data
    Stop(Signature),
    Reject(String),
}

/// Outcome of a revision negotiation the host agreed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    Continue(Signature),
    Stop(Signature),
}

impl Negotiated {
    pub fn host_signature(&self) -> &Signature {
        match self {
            Negotiated::Continue(sig) | Negotiated::Stop(sig) => sig,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Negotiated::Stop(_))
    }
}

impl RevisionResponse {
    /// Split agreement from refusal.
    pub fn into_negotiated(self) -> Result<Negotiated> {
        match self {
            RevisionResponse::Accept(sig) => Ok(Negotiated::Continue(sig)),
            RevisionResponse::Stop(sig) => Ok(Negotiated::Stop(sig)),
            RevisionResponse::Reject(reason) => Err(RenterError::Negotiation(format!(
                "host rejected revision: {}",
                reason
            ))),
        }
    }
}

/// Encode a message with its length prefix.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(message)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Check a frame length prefix against the size limit.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN], max_len: usize) -> Result<usize> {
    let len = u64::from_le_bytes(header);
    if len > max_len as u64 {
        return Err(RenterError::Protocol(format!(
            "message of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }
    Ok(len as usize)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    rmp_serde::from_slice(body)
        .map_err(|e| RenterError::Protocol(format!("malformed message: {}", e)))
}

/// Header of a sector frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub total: u64,
    pub count: u64,
    pub payload: u64,
}

impl SectorHeader {
    #[cfg(test)]
    pub fn for_payload(payload: usize) -> Self {
        Self {
            total: payload as u64 + 16,
            count: 1,
            payload: payload as u64,
        }
    }

    pub fn parse(bytes: &[u8; SECTOR_HEADER_LEN]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        Self {
            total: word(0),
            count: word(1),
            payload: word(2),
        }
    }

    #[cfg(test)]
    pub fn to_bytes(&self) -> [u8; SECTOR_HEADER_LEN] {
        let mut out = [0u8; SECTOR_HEADER_LEN];
        out[..8].copy_from_slice(&self.total.to_le_bytes());
        out[8..16].copy_from_slice(&self.count.to_le_bytes());
        out[16..].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    /// Payload length, if the header is within bounds.
    pub fn validate(&self) -> Result<usize> {
        let sector = SECTOR_SIZE as u64;
        if self.total > sector + 16 {
            return Err(RenterError::Protocol(format!(
                "sector frame of {} bytes is too large",
                self.total
            )));
        }
        if self.count != 1 {
            return Err(RenterError::Protocol(format!(
                "expected 1 sector in frame, got {}",
                self.count
            )));
        }
        if self.payload > sector {
            return Err(RenterError::Protocol(format!(
                "sector payload of {} bytes is too large",
                self.payload
            )));
        }
        Ok(self.payload as usize)
    }
}
