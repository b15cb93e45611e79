//! Configuration for LedgerKV
//!
//! Centralized configuration with sensible defaults. A node is normally
//! configured from a TOML file (`Config::from_file`); tests and embedders use
//! the builder.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{LedgerError, Result};

/// Main configuration for a LedgerKV node
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Addresses
    // -------------------------------------------------------------------------
    /// Client-facing TCP listen address
    pub server_bind: String,

    /// Address the raft transport binds to (also identifies the node)
    pub raft_bind: String,

    /// Explicit raft node id; derived from `raft_bind` when absent
    pub node_id: Option<u64>,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for everything the node persists
    /// Internal structure:
    ///   {volume}/
    ///     ├── db/              (storage engine: wal.log + sstables/)
    ///     └── raft/            (log.wal + snapshots/)
    pub volume: PathBuf,

    /// Max size of memtable before flush (in bytes)
    pub memtable_size_limit: usize,

    /// fsync the engine WAL every N entries (0 = every write)
    pub wal_sync_every: usize,

    // -------------------------------------------------------------------------
    // Raft Configuration
    // -------------------------------------------------------------------------
    /// Entries applied since the last snapshot that trigger a new one
    pub snapshot_threshold: u64,

    /// Seconds between snapshot checks
    pub snapshot_interval_secs: u64,

    /// Number of snapshots kept on disk
    pub snapshot_retain: usize,

    /// How long a client request waits for its entry to be applied
    pub request_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:5000".to_string(),
            raft_bind: "127.0.0.1:7000".to_string(),
            node_id: None,
            volume: PathBuf::from("./ledgerkv_data"),
            memtable_size_limit: 64 * 1024 * 1024, // 64 MB
            wal_sync_every: 0,
            snapshot_threshold: 20,
            snapshot_interval_secs: 120,
            snapshot_retain: 2,
            request_timeout_ms: 5000,
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 3000,
        }
    }
}

impl Config {
    const DB_DIR: &'static str = "db";
    const RAFT_DIR: &'static str = "raft";

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load a config from a TOML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.server_bind.trim().is_empty() {
            return Err(LedgerError::Config("server_bind must be set".to_string()));
        }
        if self.raft_bind.trim().is_empty() {
            return Err(LedgerError::Config("raft_bind must be set".to_string()));
        }
        // Port 0 picks a fresh port per listener
        if self.server_bind == self.raft_bind && !self.server_bind.ends_with(":0") {
            return Err(LedgerError::Config(
                "server_bind and raft_bind must differ".to_string(),
            ));
        }
        if self.volume.as_os_str().is_empty() {
            return Err(LedgerError::Config("volume must be set".to_string()));
        }
        if self.snapshot_retain == 0 {
            return Err(LedgerError::Config("snapshot_retain must be >= 1".to_string()));
        }
        if self.node_id == Some(0) {
            return Err(LedgerError::Config("node_id 0 is reserved".to_string()));
        }
        Ok(())
    }

    /// Directory of the storage engine
    pub fn db_dir(&self) -> PathBuf {
        self.volume.join(Self::DB_DIR)
    }

    /// Directory of the raft log and snapshots
    pub fn raft_dir(&self) -> PathBuf {
        self.volume.join(Self::RAFT_DIR)
    }

    /// Engine WAL sync strategy
    pub fn wal_sync_strategy(&self) -> WalSyncStrategy {
        match self.wal_sync_every {
            0 | 1 => WalSyncStrategy::EveryWrite,
            count => WalSyncStrategy::EveryNEntries { count },
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the client listen address
    pub fn server_bind(mut self, addr: impl Into<String>) -> Self {
        self.config.server_bind = addr.into();
        self
    }

    /// Set the raft transport address
    pub fn raft_bind(mut self, addr: impl Into<String>) -> Self {
        self.config.raft_bind = addr.into();
        self
    }

    /// Pin the raft node id instead of deriving it from the raft address
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = Some(id);
        self
    }

    /// Set the data volume (root for all storage)
    pub fn volume(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.volume = path.into();
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.config.memtable_size_limit = size;
        self
    }

    /// fsync the engine WAL every N entries (0 = every write)
    pub fn wal_sync_every(mut self, count: usize) -> Self {
        self.config.wal_sync_every = count;
        self
    }

    /// Entries between snapshots
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.snapshot_threshold = entries;
        self
    }

    /// Seconds between snapshot checks
    pub fn snapshot_interval_secs(mut self, secs: u64) -> Self {
        self.config.snapshot_interval_secs = secs;
        self
    }

    /// Number of snapshots to keep
    pub fn snapshot_retain(mut self, count: usize) -> Self {
        self.config.snapshot_retain = count;
        self
    }

    /// Client request timeout (in milliseconds)
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
