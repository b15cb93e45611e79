//! Raft Log Store
//!
//! Durable raft log on top of the shared WAL framing. Entries, hard state
//! and conf state are logged as protobuf blobs inside [`LogRecord`]s; the
//! latest state is rebuilt by replaying the file on startup.

use std::path::Path;

use prost::Message as ProstMessage;
use raft::eraftpb::{ConfState, Entry, HardState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WalSyncStrategy;
use crate::error::Result;
use crate::wal::{WalRecovery, WalWriter};

/// One record of the raft log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Appended entries; they replace any logged entries at the same or later index
    Entries(Vec<Vec<u8>>),
    HardState(Vec<u8>),
    ConfState(Vec<u8>),
    /// Everything up to `index` is covered by a snapshot
    Compacted { index: u64, term: u64 },
}

/// State rebuilt from the log file
#[derive(Debug, Default)]
pub struct RecoveredLog {
    pub entries: Vec<Entry>,
    pub hard_state: Option<HardState>,
    pub conf_state: Option<ConfState>,
    /// (index, term) of the last compaction point
    pub compacted: Option<(u64, u64)>,
}

impl RecoveredLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.hard_state.is_none()
            && self.conf_state.is_none()
            && self.compacted.is_none()
    }

    fn apply(&mut self, record: LogRecord) -> Result<()> {
        match record {
            LogRecord::Entries(blobs) => {
                let mut decoded = Vec::with_capacity(blobs.len());
                for blob in blobs {
                    decoded.push(Entry::decode(&blob[..])?);
                }
                if let Some(first) = decoded.first() {
                    let first_index = first.index;
                    self.entries.retain(|e| e.index < first_index);
                }
                self.entries.extend(decoded);
            }
            LogRecord::HardState(blob) => self.hard_state = Some(HardState::decode(&blob[..])?),
            LogRecord::ConfState(blob) => self.conf_state = Some(ConfState::decode(&blob[..])?),
            LogRecord::Compacted { index, term } => {
                self.entries.retain(|e| e.index > index);
                self.compacted = Some((index, term));
            }
        }
        Ok(())
    }
}

/// Append-only raft log file
pub struct RaftLogStore {
    wal: WalWriter<LogRecord>,
}

impl RaftLogStore {
    /// Open the log, replaying whatever it holds
    pub fn open(path: &Path) -> Result<(Self, RecoveredLog)> {
        let mut recovered = RecoveredLog::default();

        if path.exists() {
            let (records, result) = WalRecovery::recover::<LogRecord>(path)?;
            for record in records {
                recovered.apply(record.payload)?;
            }
            info!(
                records = result.entries_recovered,
                entries = recovered.entries.len(),
                truncated = result.was_truncated,
                "raft log recovered"
            );
        }

        // Raft requires appended entries to be durable before acknowledging
        let wal = WalWriter::open(path, WalSyncStrategy::EveryWrite)?;
        Ok((Self { wal }, recovered))
    }

    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let blobs = entries.iter().map(|e| e.encode_to_vec()).collect();
        self.wal.append(LogRecord::Entries(blobs))?;
        Ok(())
    }

    pub fn set_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        self.wal
            .append(LogRecord::HardState(hard_state.encode_to_vec()))?;
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: &ConfState) -> Result<()> {
        self.wal
            .append(LogRecord::ConfState(conf_state.encode_to_vec()))?;
        Ok(())
    }

    /// Rewrite the file so it holds only state newer than the snapshot point
    pub fn compact(
        &mut self,
        index: u64,
        term: u64,
        retained: &[Entry],
        hard_state: &HardState,
        conf_state: &ConfState,
    ) -> Result<()> {
        let mut records = Vec::with_capacity(4);
        records.push(LogRecord::Compacted { index, term });
        records.push(LogRecord::ConfState(conf_state.encode_to_vec()));
        records.push(LogRecord::HardState(hard_state.encode_to_vec()));

        let tail: Vec<Vec<u8>> = retained
            .iter()
            .filter(|e| e.index > index)
            .map(|e| e.encode_to_vec())
            .collect();
        let kept = tail.len();
        if !tail.is_empty() {
            records.push(LogRecord::Entries(tail));
        }

        self.wal.rewrite(records)?;
        debug!(index, term, kept, "raft log compacted");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.wal.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.wal");
        {
            let (mut store, recovered) = RaftLogStore::open(&path).unwrap();
            assert!(recovered.is_empty());

            store.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = 2;
            store.set_hard_state(&hs).unwrap();
            store.set_conf_state(&ConfState::from((vec![1], vec![]))).unwrap();
        }

        let (_store, recovered) = RaftLogStore::open(&path).unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(&recovered.entries[1].data[..], b"b");
        assert_eq!(recovered.hard_state.unwrap().commit, 2);
        assert_eq!(recovered.conf_state.unwrap().voters, vec![1]);
    }

    #[test]
    fn test_conflicting_append_replaces_suffix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.wal");
        {
            let (mut store, _) = RaftLogStore::open(&path).unwrap();
            store
                .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .unwrap();
            // A new leader overwrites from index 2
            store.append(&[entry(2, 2, b"x")]).unwrap();
        }

        let (_store, recovered) = RaftLogStore::open(&path).unwrap();
        let indexes: Vec<(u64, u64)> = recovered.entries.iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(indexes, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_compact_drops_covered_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.wal");
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1, b"v")).collect();
        {
            let (mut store, _) = RaftLogStore::open(&path).unwrap();
            store.append(&entries).unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = 5;
            store
                .compact(3, 1, &entries, &hs, &ConfState::from((vec![1], vec![])))
                .unwrap();
        }

        let (_store, recovered) = RaftLogStore::open(&path).unwrap();
        assert_eq!(recovered.compacted, Some((3, 1)));
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![4, 5]);
    }
}
