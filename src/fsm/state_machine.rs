//! Key-value state machine

use std::io::{Read, Write};

use raft::eraftpb::Entry;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};

use super::{
    ApplyResult, Command, FsmSnapshot, KvSnapshot, OpKind, StateMachine, StoreAdapter,
    RESTORE_BATCH_SIZE,
};

/// Applies SET / GET / DELETE commands to the local engine
pub struct KvStateMachine {
    store: StoreAdapter,
}

impl KvStateMachine {
    pub fn new(store: StoreAdapter) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    fn apply_command(&self, kind: OpKind, command: Command) -> ApplyResult {
        let Command { key, value, .. } = command;
        match kind {
            OpKind::Set => match self.store.set(&key, &value) {
                Ok(()) => ApplyResult::ok(value),
                Err(e) => ApplyResult::failed(e.to_string(), Value::Null),
            },
            OpKind::Get => match self.store.get(&key) {
                Ok(Some(found)) => ApplyResult::ok(found),
                Ok(None) => ApplyResult::missing(),
                Err(e) => ApplyResult::failed(e.to_string(), ApplyResult::missing().data),
            },
            OpKind::Delete => match self.store.delete(&key) {
                Ok(()) => ApplyResult::ok(Value::Null),
                Err(e) => ApplyResult::failed(e.to_string(), Value::Null),
            },
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &Entry) -> Option<ApplyResult> {
        let command = match Command::decode(&entry.data[..]) {
            Ok(command) => command,
            Err(e) => {
                warn!(index = entry.index, error = %e, "skipping undecodable command");
                return None;
            }
        };

        let Some(kind) = command.kind() else {
            warn!(
                index = entry.index,
                operation = %command.operation,
                "skipping unknown operation"
            );
            return None;
        };

        debug!(index = entry.index, op = kind.as_str(), key = %command.key, "apply");
        let result = self.apply_command(kind, command);
        if let Some(err) = &result.error {
            warn!(index = entry.index, error = %err, "command failed in storage");
        }
        Some(result)
    }

    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>> {
        let image = self.store.engine().backup()?;
        Ok(Box::new(KvSnapshot::new(image)))
    }

    fn restore(&mut self, mut source: Box<dyn Read + Send>) -> Result<()> {
        let loaded = self
            .store
            .engine()
            .load(&mut source, RESTORE_BATCH_SIZE)?;

        // Whatever follows the image means the stream was not what we wrote
        let trailing = std::io::copy(&mut source, &mut std::io::sink())?;
        if trailing > 0 {
            return Err(LedgerError::Snapshot(format!(
                "{} unexpected bytes after snapshot image",
                trailing
            )));
        }

        info!(keys = loaded, "state machine restored from snapshot");
        Ok(())
    }
}

/// Write a full snapshot of `fsm` to `out` (used by tests and tooling)
pub fn write_snapshot<W: Write>(fsm: &mut dyn StateMachine, out: W) -> Result<()> {
    struct Plain<W>(W);

    impl<W: Write> Write for Plain<W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }

    impl<W: Write> super::SnapshotSink for Plain<W> {
        fn id(&self) -> &str {
            "inline"
        }
        fn cancel(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let mut snapshot = fsm.snapshot()?;
    let mut sink = Plain(out);
    let result = snapshot.persist(&mut sink);
    snapshot.release();
    result
}
