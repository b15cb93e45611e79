//! Consensus Module
//!
//! Drives a tikv/raft-rs `RawNode` on one worker thread and wires it to the
//! local state machine.
//!
//! ## Architecture
//! ```text
//!   RaftHandle ──channel──► worker thread ──► RawNode<LogCache>
//!                               │   │
//!        Transport ◄── messages ┘   ├── RaftLogStore (log.wal)
//!        (TCP, per-peer senders)    ├── FileSnapshotStore (snapshots/)
//!                                   └── StateMachine (apply / snapshot / restore)
//! ```
//!
//! ## Files
//! ```text
//! {volume}/raft/
//!   ├── log.wal                         entries, hard state, conf state
//!   ├── peers.json                      raft address of each member
//!   └── snapshots/<term>-<index>-<ms>/  meta.json + state.bin
//! ```

mod bootstrap;
mod log_cache;
mod log_store;
mod node;
mod peers;
mod snapshot_store;
mod transport;

pub use bootstrap::{derive_node_id, start_node, RaftNode, LOG_FILE, SNAPSHOT_DIR};
pub use log_cache::LogCache;
pub use log_store::{LogRecord, RaftLogStore, RecoveredLog};
pub use node::{
    LeadershipEvent, MembershipChange, NodeStats, RaftHandle, ELECTION_TICK, HEARTBEAT_TICK,
    TICK_INTERVAL,
};
pub use peers::PeerBook;
pub use snapshot_store::{FileSnapshotSink, FileSnapshotStore, SnapshotMeta};
pub use transport::{Inbound, Transport};
