//! File contracts and their revisions
//!
//! A contract locks renter funds with a host. Every paid download is a new
//! revision: the revision number goes up by one and the price moves from
//! the renter's payout to the host's. Both parties sign the revision's
//! signature hash; the renter must persist the countersigned revision
//! before using the data it paid for.

use crate::error::{RenterError, Result};
use crate::metadb::{HostKey, SectorRoot};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

const REVISION_DOMAIN: &[u8] = b"shard-renter/contract-revision";

/// An amount in hastings, the smallest currency unit.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 16]", into = "[u8; 16]")]
pub struct Currency(pub u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub fn checked_add(self, other: Currency) -> Option<Currency> {
        self.0.checked_add(other.0).map(Currency)
    }

    pub fn checked_sub(self, other: Currency) -> Option<Currency> {
        self.0.checked_sub(other.0).map(Currency)
    }

    pub fn checked_mul(self, factor: u64) -> Option<Currency> {
        self.0.checked_mul(factor as u128).map(Currency)
    }
}

impl From<[u8; 16]> for Currency {
    fn from(bytes: [u8; 16]) -> Self {
        Currency(u128::from_le_bytes(bytes))
    }
}

impl From<Currency> for [u8; 16] {
    fn from(c: Currency) -> Self {
        c.0.to_le_bytes()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} H", self.0)
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.0)
    }
}

/// Identifier of a file contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractId(pub [u8; 32]);

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({}..)", &hex::encode(self.0)[..16])
    }
}

/// The mutable terms of a contract at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRevision {
    pub contract_id: ContractId,
    pub revision_number: u64,
    /// Funds still owed back to the renter
    pub renter_payout: Currency,
    /// Funds earned by the host so far
    pub host_payout: Currency,
    pub file_size: u64,
    pub file_merkle_root: SectorRoot,
    pub window_end: u64,
}

impl ContractRevision {
    /// Hash both parties sign.
    pub fn sig_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(REVISION_DOMAIN);
        hasher.update(self.contract_id.0);
        hasher.update(self.revision_number.to_le_bytes());
        hasher.update(self.renter_payout.0.to_le_bytes());
        hasher.update(self.host_payout.0.to_le_bytes());
        hasher.update(self.file_size.to_le_bytes());
        hasher.update(self.file_merkle_root.0);
        hasher.update(self.window_end.to_le_bytes());
        hasher.finalize().into()
    }

    /// The next revision after paying `price` for a download.
    ///
    /// Only the revision number and the two payouts change.
    pub fn download_revision(&self, price: Currency) -> Result<ContractRevision> {
        let renter_payout =
            self.renter_payout
                .checked_sub(price)
                .ok_or(RenterError::InsufficientFunds {
                    available: self.renter_payout.0,
                    required: price.0,
                })?;
        let host_payout = self
            .host_payout
            .checked_add(price)
            .ok_or_else(|| RenterError::Negotiation("host payout overflows".into()))?;
        let revision_number = self
            .revision_number
            .checked_add(1)
            .ok_or_else(|| RenterError::Negotiation("revision number exhausted".into()))?;

        Ok(ContractRevision {
            revision_number,
            renter_payout,
            host_payout,
            ..self.clone()
        })
    }

    pub fn sign(&self, key: &SigningKey) -> Signature {
        key.sign(&self.sig_hash())
    }
}

/// A revision with both parties' signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRevision {
    pub revision: ContractRevision,
    pub renter_signature: Signature,
    pub host_signature: Signature,
}

impl SignedRevision {
    /// Check both signatures.
    pub fn verify(&self, renter: &VerifyingKey, host: &HostKey) -> Result<()> {
        let hash = self.revision.sig_hash();
        renter
            .verify(&hash, &self.renter_signature)
            .map_err(|_| RenterError::Negotiation("bad renter signature on revision".into()))?;
        host.verify(&hash, &self.host_signature)
    }
}

/// Access to the contract a session spends from.
///
/// `sync_with_host` must durably record the countersigned revision before
/// returning; the session hands data to the caller only afterwards.
pub trait ContractEditor: Send {
    /// The latest revision both parties signed.
    fn revision(&self) -> &SignedRevision;

    /// Key used to sign new revisions.
    fn renter_key(&self) -> &SigningKey;

    /// Record a revision the host has countersigned.
    fn sync_with_host(&mut self, signed: SignedRevision) -> Result<()>;
}

/// A contract kept in memory.
pub struct MemoryContract {
    current: SignedRevision,
    renter_key: SigningKey,
    synced: u64,
}

impl MemoryContract {
    pub fn new(current: SignedRevision, renter_key: SigningKey) -> Self {
        Self {
            current,
            renter_key,
            synced: 0,
        }
    }

    /// Number of revisions recorded through `sync_with_host`.
    pub fn revisions_synced(&self) -> u64 {
        self.synced
    }
}

impl ContractEditor for MemoryContract {
    fn revision(&self) -> &SignedRevision {
        &self.current
    }

    fn renter_key(&self) -> &SigningKey {
        &self.renter_key
    }

    fn sync_with_host(&mut self, signed: SignedRevision) -> Result<()> {
        if signed.revision.contract_id != self.current.revision.contract_id {
            return Err(RenterError::Negotiation("revision for another contract".into()));
        }
        if signed.revision.revision_number <= self.current.revision.revision_number {
            return Err(RenterError::Negotiation(format!(
                "stale revision {} (have {})",
                signed.revision.revision_number, self.current.revision.revision_number
            )));
        }
        self.renter_key
            .verifying_key()
            .verify(&signed.revision.sig_hash(), &signed.renter_signature)
            .map_err(|_| RenterError::Negotiation("revision not signed by renter".into()))?;

        debug!(
            revision = signed.revision.revision_number,
            renter_payout = %signed.revision.renter_payout,
            "Recorded contract revision"
        );
        self.current = signed;
        self.synced += 1;
        Ok(())
    }
}
