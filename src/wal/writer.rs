//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Operation, WalEntry, WalReader};
use crate::config::WalSyncStrategy;
use crate::error::{LedgerError, Result};

/// Writes entries to the WAL file
pub struct WalWriter<T = Operation> {
    path: PathBuf,
    writer: BufWriter<File>,

    /// LSN the next append will receive
    next_lsn: u64,

    sync_strategy: WalSyncStrategy,

    /// Entries appended since the last fsync
    uncommitted: usize,

    _record: PhantomData<T>,
}

impl<T> WalWriter<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open or create a WAL file
    ///
    /// An existing file is scanned to continue its LSN sequence; a torn tail
    /// left by a crash is cut off so new entries follow the last valid one.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let mut next_lsn = 1;

        if path.exists() {
            let mut reader = WalReader::<T>::open(path)?;
            loop {
                match reader.next_entry() {
                    Ok(Some(entry)) => next_lsn = entry.lsn + 1,
                    Ok(None) | Err(LedgerError::WalCorruption(_)) => break,
                    Err(e) => return Err(e),
                }
            }

            let valid_len = reader.position();
            if fs::metadata(path)?.len() > valid_len {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn,
            sync_strategy,
            uncommitted: 0,
            _record: PhantomData,
        })
    }

    /// Append a record to the WAL, returning its LSN
    pub fn append(&mut self, payload: T) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = WalEntry::new(lsn, payload).serialize()?;

        self.writer
            .write_all(&bytes)
            .map_err(|e| LedgerError::WalWrite(format!("append lsn {}: {}", lsn, e)))?;
        self.next_lsn += 1;
        self.uncommitted += 1;

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.uncommitted >= count,
        };
        if due {
            self.sync()?;
        } else {
            self.writer.flush()?;
        }

        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.uncommitted = 0;
        Ok(())
    }

    /// Drop every entry; the LSN sequence continues
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(0)?;
        file.sync_all()?;
        self.uncommitted = 0;
        Ok(())
    }

    /// Atomically replace the file contents with `payloads`
    ///
    /// The new log is written next to the old one and renamed over it, so a
    /// crash leaves either the old or the new file, never a mix.
    pub fn rewrite<I>(&mut self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        let tmp_path = self.path.with_extension("rewrite");
        {
            let tmp = File::create(&tmp_path)?;
            let mut out = BufWriter::new(tmp);
            for payload in payloads {
                let bytes = WalEntry::new(self.next_lsn, payload).serialize()?;
                out.write_all(&bytes)?;
                self.next_lsn += 1;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.uncommitted = 0;
        Ok(())
    }

    /// Get the current LSN (the one the next append receives)
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Entries written since the last fsync
    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
