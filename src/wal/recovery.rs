//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL.

use std::fs::OpenOptions;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{WalEntry, WalReader};
use crate::error::{LedgerError, Result};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries skipped
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first corrupted or partial entry
    /// 3. Truncate the file back to the valid prefix
    /// 4. Return all valid entries in order
    ///
    /// Nothing after a bad entry is trusted: its length field may be garbage,
    /// and callers replay the log positionally.
    pub fn recover<T>(path: &Path) -> Result<(Vec<WalEntry<T>>, RecoveryResult)>
    where
        T: Serialize + DeserializeOwned,
    {
        let (entries, mut result, valid_len) = Self::scan(path, true)?;

        let file_len = std::fs::metadata(path)?.len();
        if file_len > valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            result.was_truncated = true;
            tracing::warn!(
                "WAL {}: dropped {} trailing bytes after lsn {}",
                path.display(),
                file_len - valid_len,
                result.last_lsn
            );
        }

        Ok((entries, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify<T>(path: &Path) -> Result<RecoveryResult>
    where
        T: Serialize + DeserializeOwned,
    {
        let (_, mut result, valid_len) = Self::scan::<T>(path, false)?;
        result.was_truncated = std::fs::metadata(path)?.len() > valid_len;
        Ok(result)
    }

    fn scan<T>(path: &Path, keep: bool) -> Result<(Vec<WalEntry<T>>, RecoveryResult, u64)>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut reader = WalReader::<T>::open(path)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    result.entries_recovered += 1;
                    result.last_lsn = entry.lsn;
                    if keep {
                        entries.push(entry);
                    }
                }
                Ok(None) => break,
                Err(LedgerError::WalCorruption(reason)) => {
                    tracing::warn!("WAL {}: {}", path.display(), reason);
                    result.entries_corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((entries, result, reader.position()))
    }
}
