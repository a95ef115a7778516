//! Host Connection Module
//!
//! Downloads sector data from a storage host, paying per byte from a file
//! contract.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                      |
//! |-------------|-----------------------------------------------------|
//! | `transport` | TCP connect, framed send/receive under a deadline   |
//! | `protocol`  | Message types, MessagePack framing, sector header   |
//! | `contract`  | Revisions, signatures, the `ContractEditor` seam    |
//! | `session`   | One paid retrieval per call, reconnect-once         |
//!
//! # Key Invariants
//!
//! - The countersigned revision is recorded through `ContractEditor` before
//!   the caller sees a single byte of the data it paid for.
//! - A dropped connection is retried once, and only before payment.
//! - Every socket operation has a deadline. During an exchange it is the
//!   negotiation window; between exchanges it is the idle timeout.
//! - Full-sector reads are checked against the sector's Merkle root.
//!
//! # Usage
//!
//! ```ignore
//! let mut session = HostSession::open(host, contract, HostSessionConfig::default()).await?;
//! let bytes = session.retrieve_range(&root, 4096, 1024).await?;
//! session.close().await;
//! ```

mod protocol;
mod session;
mod transport;

pub mod contract;

#[cfg(test)]
pub(crate) mod mock;

pub use contract::{
    ContractEditor, ContractId, ContractRevision, Currency, MemoryContract, SignedRevision,
};
pub use protocol::{DownloadAction, HostSettings, Negotiated, RevisionResponse};
pub use session::{HostInfo, HostSession, HostSessionConfig};
