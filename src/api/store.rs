//! Key-value operations through the log

use serde_json::Value;
use tracing::debug;

use crate::consensus::RaftHandle;
use crate::error::{LedgerError, Result};
use crate::fsm::{ApplyResult, Command};

/// SET / GET / DELETE submitted as log entries
///
/// SET is at-least-once: a retry after `Timeout` or `LeadershipLost`
/// may apply the same value twice.
#[derive(Clone)]
pub struct StoreApi {
    raft: RaftHandle,
}

impl StoreApi {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }

    /// Store `value` under `key`; returns the stored value
    pub fn put(&self, key: &str, value: Value) -> Result<Value> {
        let result = self.submit(Command::set(key, value))?;
        Ok(result.data)
    }

    /// Linearizable read; `None` when the key does not exist
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let result = self.submit(Command::get(key))?;
        if result.found {
            Ok(Some(result.data))
        } else {
            Ok(None)
        }
    }

    /// Remove `key`; succeeds whether or not it existed
    pub fn delete(&self, key: &str) -> Result<()> {
        self.submit(Command::delete(key))?;
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<ApplyResult> {
        debug!(op = %command.operation, key = %command.key, "submitting command");
        let result = self.raft.propose(&command)?.ok_or_else(|| {
            LedgerError::Protocol(format!("{} was not applied", command.operation))
        })?;

        match result.error {
            Some(message) => Err(LedgerError::Storage(message)),
            None => Ok(result),
        }
    }
}
