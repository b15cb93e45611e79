//! Membership and status

use tracing::info;

use crate::consensus::{MembershipChange, NodeStats, RaftHandle};
use crate::error::{LedgerError, Result};

#[derive(Clone)]
pub struct ClusterApi {
    raft: RaftHandle,
}

impl ClusterApi {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }

    /// Add node `id`, reachable for raft traffic at `addr`, as a voter
    pub fn join(&self, id: u64, addr: &str) -> Result<()> {
        if id == 0 {
            return Err(LedgerError::Protocol("node id must be non-zero".to_string()));
        }
        if addr.is_empty() {
            return Err(LedgerError::Protocol("join requires a raft address".to_string()));
        }

        info!(id, addr, "join requested");
        self.raft.change_membership(MembershipChange::AddVoter {
            id,
            addr: addr.to_string(),
        })
    }

    pub fn remove(&self, id: u64) -> Result<()> {
        info!(id, "remove requested");
        self.raft.change_membership(MembershipChange::Remove { id })
    }

    pub fn stats(&self) -> Result<NodeStats> {
        self.raft.stats()
    }
}
