//! shard-renter - Renter-side metadata and sector retrieval
//!
//! A renter stores files ("blobs") on a network of untrusted hosts. Each blob
//! is split into chunks, each chunk is erasure coded into shards, each shard
//! is encrypted and placed inside a fixed-size sector on some host. This crate
//! holds the two pieces every retrieval path depends on:
//!
//! - **Metadata store** (`metadb`): the blob → chunk → shard graph with
//!   reference counts, so a garbage collector knows which sectors no live blob
//!   still needs. Backed by memory or by sled.
//! - **Host session** (`host`): a pay-per-byte sector download protocol with
//!   contract revision negotiation, Merkle verification, and reconnect-once
//!   on transport drops.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Retriever                          │
//! │   read_range(key, offset, len) / read_blob(key)          │
//! └──────┬──────────────────────┬──────────────────┬─────────┘
//!        │                      │                  │
//!   ┌────▼─────┐        ┌───────▼──────┐    ┌──────▼───────┐
//!   │  MetaDb  │        │ HostSession  │... │ ErasureCoder │
//!   │ mem/sled │        │ (per host)   │    │ Reed-Solomon │
//!   └──────────┘        └──────┬───────┘    └──────────────┘
//!                              │ TCP, length-prefixed MessagePack
//!                       ┌──────▼───────┐
//!                       │     Host     │
//!                       └──────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! let config = Config::load_or_default(Config::default().config_path())?;
//! let metadb = open_metadb(&config)?;
//! let retriever = Retriever::connect(
//!     metadb,
//!     Box::new(ReedSolomonCoder),
//!     hosts,
//!     HostSessionConfig::from(&config),
//! ).await;
//! let bytes = retriever.read_blob(b"photos/2024/beach.jpg").await?;
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod host;
pub mod metadb;
pub mod retrieval;
pub mod sharding;

pub use config::{Config, MetaDbBackend};
pub use crypto::{ChunkKey, KeySeed};
pub use error::{RenterError, Result};
pub use host::{
    ContractEditor, ContractRevision, Currency, HostInfo, HostSession, HostSessionConfig,
    MemoryContract, SignedRevision,
};
pub use metadb::{
    open_metadb, BlobRecord, ChunkRecord, HostKey, MemoryMetaDb, MetaDb, SectorRoot, ShardRecord,
    SledMetaDb,
};
pub use retrieval::Retriever;
pub use sharding::{ErasureCoder, ReedSolomonCoder};

/// Size of a host sector in bytes (4 MiB).
pub const SECTOR_SIZE: usize = 1 << 22;
