//! Node Bootstrap
//!
//! Assembles a raft node from its on-disk pieces and starts the worker.
//!
//! ## Startup Order
//! 1. Open the snapshot store and the raft log
//! 2. Reset the state machine to the latest snapshot (or to empty)
//! 3. Rebuild the in-memory log: snapshot point, conf state, entries, hard state
//! 4. Bind the transport, create the `RawNode` and spawn the worker
//!
//! Entries after the snapshot point are re-applied by the worker as they are
//! reported committed, so the store always reflects a prefix of the log.

use std::fs;
use std::io::{BufReader, Cursor};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver};
use raft::eraftpb::{ConfState, HardState, Snapshot};
use raft::storage::{MemStorage, Storage};
use raft::RawNode;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{LedgerError, Result};
use crate::fsm::{KvStateMachine, StateMachine, StoreAdapter};
use crate::storage::EngineImage;

use super::log_cache::LogCache;
use super::log_store::{RaftLogStore, RecoveredLog};
use super::node::{
    spawn_worker, LeadershipEvent, NodeOptions, RaftHandle, WorkerParts, ELECTION_TICK,
    HEARTBEAT_TICK,
};
use super::peers::PeerBook;
use super::snapshot_store::FileSnapshotStore;
use super::transport::Transport;

pub const LOG_FILE: &str = "log.wal";
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Node id derived from the raft address, never zero
pub fn derive_node_id(raft_bind: &str) -> u64 {
    match crc32fast::hash(raft_bind.as_bytes()) as u64 {
        0 => 1,
        id => id,
    }
}

/// A started node: the request handle plus the threads around it
pub struct RaftNode {
    handle: RaftHandle,
    raft_addr: String,
    api_addr: String,
    observer: Option<JoinHandle<()>>,
}

impl RaftNode {
    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Address peers dial for raft traffic
    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    pub fn api_addr(&self) -> &str {
        &self.api_addr
    }

    /// Stop the worker and wait for the observer to drain
    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(observer) = self.observer.take() {
            let _ = observer.join();
        }
        info!(node = self.handle.id(), "raft node stopped");
    }
}

/// Build and start the node for `config`
///
/// `api_addr` is the client address handed to callers redirected here.
/// With `bootstrap` set, a brand-new node becomes a single-voter cluster;
/// a node that already has a log or snapshot refuses.
pub fn start_node(
    config: &Config,
    engine: Arc<Engine>,
    api_addr: &str,
    bootstrap: bool,
) -> Result<RaftNode> {
    let id = config
        .node_id
        .unwrap_or_else(|| derive_node_id(&config.raft_bind));
    let raft_dir = config.raft_dir();
    fs::create_dir_all(&raft_dir)?;

    let snapshots = Arc::new(FileSnapshotStore::open(
        &raft_dir.join(SNAPSHOT_DIR),
        config.snapshot_retain,
    )?);
    let (mut log_store, recovered) = RaftLogStore::open(&raft_dir.join(LOG_FILE))?;
    let latest = snapshots.latest_meta()?;

    let fresh = recovered.is_empty() && latest.is_none();
    if bootstrap && !fresh {
        return Err(LedgerError::Config(format!(
            "node {} already has raft state in {}; refusing to bootstrap",
            id,
            raft_dir.display()
        )));
    }

    let mut fsm: Box<dyn StateMachine> = Box::new(KvStateMachine::new(StoreAdapter::new(engine)));

    // Reset the store to the snapshot point before any entry is replayed
    let snapshot_point = match &latest {
        Some(meta) => {
            let (meta, file) = snapshots.open_image(&meta.id)?;
            fsm.restore(Box::new(BufReader::new(file)))?;
            info!(node = id, index = meta.index, term = meta.term, "state restored from snapshot");
            Some((meta.index, meta.term, meta.conf_state()?))
        }
        None => {
            let mut empty = Vec::new();
            EngineImage::default().write_to(&mut empty)?;
            fsm.restore(Box::new(Cursor::new(empty)))?;
            None
        }
    };

    let (mem, applied) = if bootstrap {
        let conf_state = ConfState::from((vec![id], vec![]));
        let mem = MemStorage::new_with_conf_state(conf_state.clone());
        let hard_state = mem.rl().hard_state().clone();
        log_store.compact(1, 1, &[], &hard_state, &conf_state)?;
        info!(node = id, "bootstrapping single-voter cluster");
        (mem, 1)
    } else {
        rebuild_log(id, recovered, snapshot_point)?
    };

    let last_snapshot = snapshots
        .latest_meta()?
        .map(|meta| (meta.index, meta.term))
        .unwrap_or((0, 0));
    let conf_state = mem.initial_state()?.conf_state;

    let (transport, inbound) = Transport::bind(&config.raft_bind, api_addr)?;
    let raft_addr = transport.local_addr().to_string();

    let raft_config = raft::Config {
        id,
        election_tick: ELECTION_TICK,
        heartbeat_tick: HEARTBEAT_TICK,
        applied,
        max_size_per_msg: 1024 * 1024,
        max_inflight_msgs: 256,
        pre_vote: true,
        // A leader cut off from a quorum steps down and fails its waiters
        check_quorum: true,
        ..Default::default()
    };
    raft_config.validate()?;

    let cache = LogCache::new(mem, Arc::clone(&snapshots));
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let mut raw = RawNode::new(&raft_config, cache.clone(), &logger)?;
    if bootstrap {
        raw.campaign()?;
    }

    let (leadership_tx, leadership_rx) = unbounded();
    let observer = thread::Builder::new()
        .name(format!("raft-leadership-{}", id))
        .spawn(move || observe_leadership(leadership_rx))?;

    let options = NodeOptions {
        id,
        snapshot_threshold: config.snapshot_threshold,
        snapshot_interval: config.snapshot_interval(),
        request_timeout: config.request_timeout(),
    };

    let handle = spawn_worker(WorkerParts {
        options,
        raw,
        cache,
        log_store,
        fsm,
        transport,
        inbound,
        peers: PeerBook::load(&raft_dir)?,
        api_addr: api_addr.to_string(),
        conf_state,
        applied,
        last_snapshot,
        leadership: leadership_tx,
    })?;

    info!(
        node = id,
        raft_addr = %raft_addr,
        api_addr = %api_addr,
        applied,
        "raft node started"
    );

    Ok(RaftNode {
        handle,
        raft_addr,
        api_addr: api_addr.to_string(),
        observer: Some(observer),
    })
}

/// Rebuild the in-memory log of an existing node
///
/// Returns the storage and the index the state machine reflects.
fn rebuild_log(
    id: u64,
    mut recovered: RecoveredLog,
    snapshot_point: Option<(u64, u64, ConfState)>,
) -> Result<(MemStorage, u64)> {
    let (snap_index, snap_term, snap_conf) = match snapshot_point {
        Some((index, term, conf)) => (index, term, Some(conf)),
        None => (0, 0, None),
    };

    // The bootstrap point (1, 1) carries no data, anything later must be in a snapshot
    if let Some((index, _)) = recovered.compacted {
        if index > snap_index && index > 1 {
            return Err(LedgerError::Snapshot(format!(
                "raft log compacted to {} but the newest snapshot is at {}",
                index, snap_index
            )));
        }
    }

    let (base_index, base_term) = match recovered.compacted {
        Some((index, term)) if index > snap_index => (index, term),
        _ => (snap_index, snap_term),
    };

    let conf_state = recovered
        .conf_state
        .take()
        .or(snap_conf)
        .unwrap_or_default();

    let mem = MemStorage::new();
    {
        let mut core = mem.wl();
        if base_index > 0 {
            let mut snap = Snapshot::default();
            let md = snap.mut_metadata();
            md.index = base_index;
            md.term = base_term;
            md.set_conf_state(conf_state.clone());
            core.apply_snapshot(snap)?;
        }
        core.set_conf_state(conf_state);

        recovered.entries.retain(|e| e.index > base_index);
        if let Some(first) = recovered.entries.first() {
            if first.index != base_index + 1 {
                warn!(node = id, first = first.index, base_index, "gap after snapshot point");
                return Err(LedgerError::Storage(format!(
                    "raft log resumes at {} after snapshot point {}",
                    first.index, base_index
                )));
            }
        }
        core.append(&recovered.entries)?;

        let mut hard_state = recovered.hard_state.take().unwrap_or_else(HardState::default);
        hard_state.commit = hard_state.commit.max(base_index);
        hard_state.term = hard_state.term.max(base_term);
        core.set_hardstate(hard_state);
    }

    info!(
        node = id,
        snapshot_index = base_index,
        entries = recovered.entries.len(),
        "raft log rebuilt"
    );
    Ok((mem, base_index))
}

fn observe_leadership(events: Receiver<LeadershipEvent>) {
    for event in events.iter() {
        if event.is_leader() {
            info!(node = event.node_id, term = event.term, "became leader");
        } else if event.leader_id == 0 {
            info!(node = event.node_id, term = event.term, role = ?event.role, "no known leader");
        } else {
            info!(
                node = event.node_id,
                term = event.term,
                leader = event.leader_id,
                role = ?event.role,
                "following leader"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_id_is_stable_and_nonzero() {
        let a = derive_node_id("127.0.0.1:7000");
        let b = derive_node_id("127.0.0.1:7000");
        let c = derive_node_id("127.0.0.1:7001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_rebuild_empty_log() {
        let (mem, applied) = rebuild_log(1, RecoveredLog::default(), None).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(mem.rl().hard_state().commit, 0);
    }

    #[test]
    fn test_rebuild_rejects_compaction_past_snapshot() {
        let recovered = RecoveredLog {
            compacted: Some((50, 2)),
            ..Default::default()
        };
        assert!(rebuild_log(1, recovered, Some((20, 2, ConfState::default()))).is_err());
    }
}
