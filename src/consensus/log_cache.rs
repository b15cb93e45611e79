//! Log Cache
//!
//! In-memory view of the raft log that `RawNode` reads from. Writes go to
//! the durable [`RaftLogStore`](super::RaftLogStore) first and are mirrored
//! here by the node; snapshots are served from the snapshot store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::storage::{MemStorage, RaftState, Storage};
use raft::{GetEntriesContext, StorageError};
use tracing::{debug, warn};

use super::snapshot_store::FileSnapshotStore;

/// `raft::Storage` over `MemStorage`, with snapshots from disk
#[derive(Clone)]
pub struct LogCache {
    mem: MemStorage,
    snapshots: Arc<FileSnapshotStore>,
    /// Set when raft asked for a snapshot we could not serve yet
    snapshot_wanted: Arc<AtomicBool>,
}

impl LogCache {
    pub fn new(mem: MemStorage, snapshots: Arc<FileSnapshotStore>) -> Self {
        Self {
            mem,
            snapshots,
            snapshot_wanted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Direct access for the node's write path
    pub fn mem(&self) -> &MemStorage {
        &self.mem
    }

    pub fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    /// Entries currently cached after `index`
    pub fn entries_after(&self, index: u64) -> Vec<Entry> {
        let first = match self.mem.first_index() {
            Ok(first) => first.max(index + 1),
            Err(_) => return Vec::new(),
        };
        let last = match self.mem.last_index() {
            Ok(last) => last,
            Err(_) => return Vec::new(),
        };
        if first > last {
            return Vec::new();
        }
        self.mem
            .entries(first, last + 1, None, GetEntriesContext::empty(false))
            .unwrap_or_default()
    }

    /// Whether a follower is waiting for a snapshot; clears the flag
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot_wanted.swap(false, Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> &Arc<FileSnapshotStore> {
        &self.snapshots
    }
}

impl Storage for LogCache {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let compacted = self.mem.first_index()?.saturating_sub(1);

        match self.snapshots.latest() {
            Ok(Some(snap)) => {
                let index = snap.get_metadata().index;
                if index >= request_index && index >= compacted {
                    debug!(to, index, "serving snapshot");
                    return Ok(snap);
                }
                debug!(to, index, request_index, compacted, "stored snapshot too old");
            }
            Ok(None) => debug!(to, "no snapshot stored yet"),
            Err(e) => {
                warn!(to, error = %e, "cannot load snapshot");
                return Err(raft::Error::Store(StorageError::Other(Box::new(e))));
            }
        }

        self.snapshot_wanted.store(true, Ordering::SeqCst);
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}
