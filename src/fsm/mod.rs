//! State Machine Module
//!
//! The replicated state machine the raft node drives.
//!
//! ## Responsibilities
//! - Decode committed log entries into [`Command`]s
//! - Apply them, in log order, to the local engine through [`StoreAdapter`]
//! - Capture point-in-time snapshots and restore from them
//!
//! ## Boundary
//! The raft node only knows the traits in this module. It calls
//! [`StateMachine::apply`] and [`StateMachine::snapshot`] on its worker thread,
//! then hands the returned [`FsmSnapshot`] to a background thread that calls
//! `persist` followed by `release`.
//!
//! ```text
//!  committed Entry ──► apply() ──► Command ──► StoreAdapter ──► Engine
//!                         │
//!                         └──► Option<ApplyResult> (to the waiting request)
//! ```

mod adapter;
mod command;
mod snapshot;
mod state_machine;

use std::io::{Read, Write};

use raft::eraftpb::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use adapter::StoreAdapter;
pub use command::{Command, OpKind};
pub use snapshot::KvSnapshot;
pub use state_machine::{write_snapshot, KvStateMachine};

/// Number of records loaded per batch when restoring
pub const RESTORE_BATCH_SIZE: usize = 1024;

/// Outcome of applying one command, delivered to the proposer only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Storage failure message, if any
    pub error: Option<String>,

    /// SET echoes the value, GET returns it, DELETE returns null
    pub data: Value,

    /// False only for a GET that found nothing
    pub found: bool,
}

impl ApplyResult {
    pub fn ok(data: Value) -> Self {
        Self {
            error: None,
            data,
            found: true,
        }
    }

    /// GET miss; `data` is the empty-object placeholder
    pub fn missing() -> Self {
        Self {
            error: None,
            data: Value::Object(Default::default()),
            found: false,
        }
    }

    pub fn failed(message: impl Into<String>, data: Value) -> Self {
        Self {
            error: Some(message.into()),
            data,
            found: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Application state driven by the consensus log
///
/// All calls happen on one thread, in log order. `apply` must be a pure
/// function of the current state and the entry.
pub trait StateMachine: Send {
    /// Apply one committed normal entry
    ///
    /// `None` means the entry was not a command this machine understands; it
    /// still counts as applied.
    fn apply(&mut self, entry: &Entry) -> Option<ApplyResult>;

    /// Capture a point-in-time view of the current state
    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>>;

    /// Discard all state and replace it with the contents of `source`
    fn restore(&mut self, source: Box<dyn Read + Send>) -> Result<()>;
}

/// A captured view waiting to be written out
pub trait FsmSnapshot: Send {
    /// Write the view into `sink`; the caller cancels the sink on error
    fn persist(&mut self, sink: &mut dyn SnapshotSink) -> Result<()>;

    /// Drop whatever the view holds; called after `persist` in every case
    fn release(&mut self);
}

/// Destination of a snapshot being persisted
pub trait SnapshotSink: Write {
    /// Identifier of the snapshot under construction
    fn id(&self) -> &str;

    /// Abandon the snapshot; nothing written so far becomes visible
    fn cancel(&mut self) -> Result<()>;
}
