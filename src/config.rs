//! Configuration for shard-renter

use crate::error::{RenterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shard-renter")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the metadata database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default)]
    pub metadb: MetaDbConfig,

    #[serde(default)]
    pub host: HostConfig,
}

/// Which `MetaDb` implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaDbBackend {
    Memory,
    #[default]
    Sled,
}

/// Metadata store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaDbConfig {
    #[serde(default)]
    pub backend: MetaDbBackend,

    /// sled page cache size in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,

    /// Background flush interval; `None` flushes only on close
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: Option<u64>,
}

/// Host connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// TCP connect plus handshake
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Deadline for one negotiation exchange
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Deadline restored between exchanges
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Largest protocol message accepted from a host
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

fn default_flush_every_ms() -> Option<u64> {
    Some(500)
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_negotiation_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

impl Default for MetaDbConfig {
    fn default() -> Self {
        Self {
            backend: MetaDbBackend::default(),
            cache_capacity_bytes: default_cache_capacity(),
            flush_every_ms: default_flush_every_ms(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            metadb: MetaDbConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RenterError::Config(e.to_string()))
    }

    /// Load config from file, falling back to defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RenterError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get metadata database path
    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_dir.join("metadata.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
