//! Storage Manager
//!
//! Manages multiple SSTables and coordinates reads/writes.
//!
//! ## Responsibilities
//! - Discover existing SSTables on startup
//! - Search SSTables newest → oldest for reads
//! - Create new SSTables from MemTable flushes
//! - Swap the whole table set for a restored backup image
//!
//! ## Base Tables
//! A restore writes one `base_NNNNNN.sst` holding the complete image. A base
//! table supersedes every table with a smaller id, so on startup anything
//! older than the newest base is deleted. The rename of the finished base
//! file is the commit point of a restore.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::memtable::{MemTable, MemTableEntry};

use super::{SSTable, SSTableBuilder, SSTableReader};

const FLUSH_PREFIX: &str = "sstable_";
const BASE_PREFIX: &str = "base_";
const TABLE_EXT: &str = "sst";
const STAGING_EXT: &str = "staging";

/// Manages the storage layer
///
/// ## Concurrency:
/// - `sstables`: Protected by RwLock (many concurrent readers, exclusive writer)
/// - `next_sstable_id`: Atomic counter (lock-free)
/// - All methods use `&self` (no exclusive access needed)
pub struct StorageManager {
    /// Directory where SSTables are stored
    data_dir: PathBuf,

    /// Open SSTable readers, ordered newest → oldest
    sstables: RwLock<Vec<SSTableReader>>,

    /// Next ID for creating new SSTables (atomic, lock-free)
    next_sstable_id: AtomicU64,
}

/// A base table being written; invisible to readers until installed
pub struct StagedTable {
    id: u64,
    staging_path: PathBuf,
    builder: SSTableBuilder,
}

impl StagedTable {
    /// Add a live key; keys must arrive in ascending order
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.builder.add(key, value)
    }

    pub fn entry_count(&self) -> u64 {
        self.builder.entry_count()
    }

    /// Drop the partially written file
    pub fn abandon(self) {
        let path = self.staging_path.clone();
        drop(self.builder);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove staged table");
        }
    }
}

impl StorageManager {
    /// Open or create storage in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Remove staged tables left by an interrupted restore
    /// 3. Drop tables superseded by the newest base table
    /// 4. Open readers newest first (loads indexes into RAM)
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;

        let mut tables: Vec<(u64, PathBuf, bool)> = Vec::new();
        for entry in fs::read_dir(path)? {
            let file_path = entry?.path();
            if !file_path.is_file() {
                continue;
            }
            if file_path.extension().map_or(false, |ext| ext == STAGING_EXT) {
                warn!(path = %file_path.display(), "removing interrupted restore table");
                fs::remove_file(&file_path)?;
                continue;
            }
            if let Some((id, is_base)) = Self::parse_table_name(&file_path) {
                tables.push((id, file_path, is_base));
            }
        }

        // Newest first (highest ID first)
        tables.sort_by(|a, b| b.0.cmp(&a.0));
        let next_id = tables.first().map(|(id, _, _)| id + 1).unwrap_or(1);

        if let Some(base_pos) = tables.iter().position(|(_, _, is_base)| *is_base) {
            for (id, stale, _) in tables.split_off(base_pos + 1) {
                debug!(id, path = %stale.display(), "removing table superseded by base");
                fs::remove_file(&stale)?;
            }
        }

        let mut sstables = Vec::with_capacity(tables.len());
        for (_, table_path, _) in &tables {
            sstables.push(SSTableReader::open(table_path)?);
        }

        if !sstables.is_empty() {
            info!(count = sstables.len(), dir = %path.display(), "opened SSTables");
        }

        Ok(Self {
            data_dir: path.to_path_buf(),
            sstables: RwLock::new(sstables),
            next_sstable_id: AtomicU64::new(next_id),
        })
    }

    /// Get a value by key (searches all SSTables newest → oldest)
    ///
    /// Returns:
    /// - `Ok(Some(value))`: key found with value
    /// - `Ok(None)`: key not found, or found tombstone (deleted)
    ///
    /// Takes the write lock because `SSTableReader::get()` seeks its file.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut sstables = self.sstables.write();

        for reader in sstables.iter_mut() {
            if !reader.might_contain(key) {
                continue;
            }

            match reader.get(key) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => return Ok(None),
                Err(LedgerError::KeyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Flush a MemTable to a new SSTable
    ///
    /// Creates a new SSTable file from the MemTable's sorted entries,
    /// opens a reader for it, and adds it to the front of the list.
    pub fn flush(&self, memtable: &MemTable) -> Result<SSTable> {
        if memtable.is_empty() {
            return Err(LedgerError::Storage(
                "Cannot flush empty MemTable".to_string(),
            ));
        }

        let id = self.next_sstable_id.fetch_add(1, Ordering::SeqCst);
        let path = self.table_path(FLUSH_PREFIX, id);

        let mut builder = SSTableBuilder::new(&path)?;
        for (key, entry) in memtable.iter() {
            match entry {
                MemTableEntry::Value(v) => builder.add(&key, &v)?,
                MemTableEntry::Tombstone => builder.add_tombstone(&key)?,
            }
        }
        let metadata = builder.finish()?;

        let reader = SSTableReader::open(&path)?;
        self.sstables.write().insert(0, reader);

        debug!(
            id,
            entries = metadata.entry_count,
            bytes = metadata.file_size,
            "flushed memtable"
        );
        Ok(metadata)
    }

    /// Resolve every table into the newest version of each key
    ///
    /// Tombstones are kept as `None` so callers can mask memtable state.
    pub fn merged_entries(&self) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        let mut sstables = self.sstables.write();
        let mut merged = BTreeMap::new();

        // Oldest first, newer tables overwrite
        for reader in sstables.iter_mut().rev() {
            for item in reader.iter()? {
                let (key, value) = item?;
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }

    /// Start writing a base table for a restore
    pub fn stage_base(&self) -> Result<StagedTable> {
        let id = self.next_sstable_id.fetch_add(1, Ordering::SeqCst);
        let staging_path = self
            .table_path(BASE_PREFIX, id)
            .with_extension(STAGING_EXT);
        let builder = SSTableBuilder::new(&staging_path)?;
        Ok(StagedTable {
            id,
            staging_path,
            builder,
        })
    }

    /// Make a staged base table the only table
    ///
    /// The rename is the commit point; older files are removed afterwards
    /// and are ignored by `open` if that removal is interrupted.
    pub fn install_base(&self, staged: StagedTable) -> Result<SSTable> {
        let StagedTable {
            id,
            staging_path,
            builder,
        } = staged;

        let metadata = match builder.finish() {
            Ok(metadata) => metadata,
            Err(e) => {
                let _ = fs::remove_file(&staging_path);
                return Err(e);
            }
        };

        let final_path = self.table_path(BASE_PREFIX, id);
        fs::rename(&staging_path, &final_path)?;
        let reader = SSTableReader::open(&final_path)?;

        let replaced = {
            let mut sstables = self.sstables.write();
            std::mem::replace(&mut *sstables, vec![reader])
        };

        for old in replaced {
            if let Err(e) = fs::remove_file(old.path()) {
                warn!(path = %old.path().display(), error = %e, "failed to remove replaced table");
            }
        }

        info!(id, entries = metadata.entry_count, "installed base table");
        Ok(SSTable {
            path: final_path,
            ..metadata
        })
    }

    /// Get the number of SSTables
    pub fn sstable_count(&self) -> usize {
        self.sstables.read().len()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the next SSTable ID (for testing/debugging)
    pub fn next_sstable_id(&self) -> u64 {
        self.next_sstable_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn table_path(&self, prefix: &str, id: u64) -> PathBuf {
        self.data_dir
            .join(format!("{}{:06}.{}", prefix, id, TABLE_EXT))
    }

    /// "sstable_000042.sst" → (42, false), "base_000043.sst" → (43, true)
    fn parse_table_name(path: &Path) -> Option<(u64, bool)> {
        if path.extension()? != TABLE_EXT {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        if let Some(id) = name.strip_prefix(FLUSH_PREFIX) {
            return id.parse().ok().map(|id| (id, false));
        }
        if let Some(id) = name.strip_prefix(BASE_PREFIX) {
            return id.parse().ok().map(|id| (id, true));
        }
        None
    }
}
