//! Error types for shard-renter

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenterError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid range: offset {offset} + length {length} exceeds {limit}")]
    InvalidRange { offset: u64, length: u64, limit: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    /// The host dropped the connection mid-exchange (EOF, reset, broken pipe).
    ///
    /// Never surfaced from `HostSession::retrieve_range`: it either triggers
    /// the single reconnect-and-retry, or is converted to `Connection`.
    #[error("Host disconnected: {0}")]
    HostDisconnected(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Insufficient funds: contract has {available} hastings, download costs {required}")]
    InsufficientFunds { available: u128, required: u128 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Incomplete transfer: {0}")]
    IncompleteTransfer(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Chunk {chunk} unavailable: need {needed} shards, retrieved {retrieved}")]
    ChunkUnavailable { chunk: u64, needed: usize, retrieved: usize },

    #[error("Erasure coding error: {0}")]
    Erasure(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Incompatible store format: found version {found}, expected {expected}")]
    IncompatibleFormat { found: u8, expected: u8 },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RenterError {
    /// Whether this is a legitimate absence (`KeyNotFound`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RenterError::KeyNotFound(_))
    }

    /// Whether the failure is a transport drop that a fresh handshake may cure.
    pub fn is_retryable_disconnect(&self) -> bool {
        matches!(self, RenterError::HostDisconnected(_))
    }

    /// Whether the error means the host misbehaved.
    pub fn is_host_fault(&self) -> bool {
        matches!(
            self,
            RenterError::Protocol(_)
                | RenterError::IncompleteTransfer(_)
                | RenterError::IntegrityViolation(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for RenterError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RenterError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RenterError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RenterError::Encoding(e.to_string())
    }
}

/// Result type for renter operations
pub type Result<T> = std::result::Result<T, RenterError>;
