//! Command Surface
//!
//! What a client connection can ask of a node. Every data operation,
//! reads included, goes through the raft log; membership operations go
//! through raft's conf-change path.
//!
//! ## Outcomes
//! - Follower: `NotLeader` immediately, carrying the leader's client address
//! - Leader: blocks until this node applied the entry, or `Timeout` /
//!   `LeadershipLost` when the outcome is unknown

mod cluster;
mod store;

pub use cluster::ClusterApi;
pub use store::StoreApi;
