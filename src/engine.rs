//! Engine Module
//!
//! The local storage engine underneath the state machine.
//!
//! ## Responsibilities
//! - Coordinate WAL, MemTable, and Storage
//! - Handle concurrent read/write access
//! - Trigger flushes when MemTable is full
//! - Manage crash recovery on startup
//! - Produce point-in-time backups and load them back

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::memtable::{MemTable, MemTableEntry};
use crate::storage::{EngineImage, ImageReader, StorageManager};
use crate::wal::{Operation, WalRecovery, WalWriter};

/// The storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete/flush/load): Serialized by `write_lock`
///   - Must acquire: write_lock → WAL → memtable → storage (write)
///
/// - **Reads** (get): no `write_lock`
///   - MemTable uses internal RwLock (many concurrent readers)
///   - StorageManager takes its table lock for SSTable reads
///
/// `backup()` holds `write_lock` while it merges, so the image reflects
/// exactly the writes that completed before it.
pub struct Engine {
    config: Config,

    /// Directory holding the WAL and the sstables/ directory
    db_dir: PathBuf,

    storage_dir: PathBuf,

    /// Write-ahead log for durability
    wal: Mutex<WalWriter>,

    /// In-memory table for recent writes (internal RwLock)
    memtable: MemTable,

    /// Persistent storage manager (internal RwLock on sstables vec)
    storage: StorageManager,

    /// Serializes write operations
    write_lock: Mutex<()>,
}

impl Engine {
    const WAL_FILENAME: &'static str = "wal.log";
    const SSTABLE_DIR: &'static str = "sstables";

    /// Open or create an engine under `config.db_dir()`
    ///
    /// On startup:
    /// 1. Open/create the db directory
    /// 2. Load existing SSTables
    /// 3. Replay the WAL, flush the replayed entries and truncate the WAL
    pub fn open(config: Config) -> Result<Self> {
        let db_dir = config.db_dir();
        fs::create_dir_all(&db_dir)?;

        let storage_dir = db_dir.join(Self::SSTABLE_DIR);
        let wal_path = db_dir.join(Self::WAL_FILENAME);

        let storage = StorageManager::open(&storage_dir)?;
        let memtable = MemTable::new();

        let mut wal = if wal_path.exists() {
            let (entries, recovery) = WalRecovery::recover::<Operation>(&wal_path)?;

            if recovery.entries_recovered > 0 || recovery.entries_corrupted > 0 {
                info!(
                    recovered = recovery.entries_recovered,
                    corrupted = recovery.entries_corrupted,
                    last_lsn = recovery.last_lsn,
                    "engine WAL recovery"
                );
            }

            for entry in entries {
                match entry.payload {
                    Operation::Put { key, value } => {
                        memtable.put(key, value);
                    }
                    Operation::Delete { key } => {
                        memtable.delete(key);
                    }
                }
            }

            WalWriter::open(&wal_path, config.wal_sync_strategy())?
        } else {
            WalWriter::open(&wal_path, config.wal_sync_strategy())?
        };

        // Make recovered entries durable in an SSTable before dropping the WAL
        if !memtable.is_empty() {
            debug!(entries = memtable.entry_count(), "flushing recovered entries");
            storage.flush(&memtable)?;
            memtable.clear();
            wal.truncate()?;
        }

        Ok(Self {
            config,
            db_dir,
            storage_dir,
            wal: Mutex::new(wal),
            memtable,
            storage,
            write_lock: Mutex::new(()),
        })
    }

    /// Open with a volume path and otherwise default config
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().volume(path).build())
    }

    /// Get a value by key
    ///
    /// Search order:
    /// 1. MemTable (most recent writes)
    /// 2. SSTables (newest to oldest)
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.memtable.get(key) {
            return match entry {
                MemTableEntry::Value(value) => Ok(Some(value)),
                MemTableEntry::Tombstone => Ok(None),
            };
        }

        self.storage.get(key)
    }

    /// Put a key-value pair
    ///
    /// WAL first, then MemTable, then flush if the MemTable is full.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _write_guard = self.write_lock.lock();

        self.wal.lock().append(Operation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;

        let new_size = self.memtable.put(key.to_vec(), value.to_vec());
        if new_size >= self.config.memtable_size_limit {
            self.flush_internal()?;
        }

        Ok(())
    }

    /// Delete a key; deleting an absent key is not an error
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let _write_guard = self.write_lock.lock();

        self.wal.lock().append(Operation::Delete { key: key.to_vec() })?;

        let new_size = self.memtable.delete(key.to_vec());
        if new_size >= self.config.memtable_size_limit {
            self.flush_internal()?;
        }

        Ok(())
    }

    /// Force a flush regardless of memtable size
    pub fn flush(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        self.flush_internal()
    }

    /// Called with `write_lock` held
    fn flush_internal(&self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }

        self.storage.flush(&self.memtable)?;
        self.memtable.clear();

        // Entries are now durable in the SSTable
        self.wal.lock().truncate()?;

        Ok(())
    }

    /// Capture every live key as of now
    ///
    /// Writes are blocked while the image is assembled; the image itself is
    /// owned, so writing it out can happen later on another thread.
    pub fn backup(&self) -> Result<EngineImage> {
        let _write_guard = self.write_lock.lock();

        let mut merged = self.storage.merged_entries()?;
        for (key, entry) in self.memtable.iter() {
            match entry {
                MemTableEntry::Value(v) => merged.insert(key, Some(v)),
                MemTableEntry::Tombstone => merged.insert(key, None),
            };
        }

        let live = merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
        Ok(EngineImage::new(live))
    }

    /// Replace the entire contents with a backup image read from `source`
    ///
    /// The image is read in batches of `batch_size` records into a staged
    /// table. Any failure before the swap leaves the current contents intact.
    pub fn load<R: Read>(&self, source: R, batch_size: usize) -> Result<u64> {
        let mut reader = ImageReader::new(source)?;
        let mut staged = self.storage.stage_base()?;

        loop {
            let batch = match reader.next_batch(batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    staged.abandon();
                    return Err(e);
                }
            };
            if batch.is_empty() {
                break;
            }
            for (key, value) in &batch {
                if let Err(e) = staged.add(key, value) {
                    staged.abandon();
                    return Err(e);
                }
            }
        }

        let loaded = staged.entry_count();

        let _write_guard = self.write_lock.lock();
        self.storage.install_base(staged)?;
        self.memtable.clear();
        if let Err(e) = self.wal.lock().truncate() {
            // The base table is installed; a stale WAL tail would replay on top of it
            warn!(error = %e, "failed to truncate engine WAL after load");
            return Err(e);
        }

        info!(entries = loaded, "engine contents replaced from backup");
        Ok(loaded)
    }

    /// Close the engine gracefully
    ///
    /// Flushes any pending data and syncs to disk
    pub fn close(self) -> Result<()> {
        if !self.memtable.is_empty() {
            self.flush()?;
        }
        self.wal.lock().sync()?;
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Directory holding the WAL and SSTables
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Get the storage directory path (where SSTables are stored)
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Get the current memtable size
    pub fn memtable_size(&self) -> usize {
        self.memtable.size()
    }

    /// Get the memtable entry count
    pub fn memtable_entry_count(&self) -> usize {
        self.memtable.entry_count()
    }

    /// Get the number of SSTables
    pub fn sstable_count(&self) -> usize {
        self.storage.sstable_count()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
