//! Snapshot of the key-value state
//!
//! Capture and persistence are split: `KvStateMachine::snapshot` takes an
//! owned [`EngineImage`] on the apply thread, and [`KvSnapshot::persist`]
//! streams it out later without touching the engine again.

use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::storage::EngineImage;

use super::{FsmSnapshot, SnapshotSink};

pub struct KvSnapshot {
    image: Option<EngineImage>,
}

impl KvSnapshot {
    pub fn new(image: EngineImage) -> Self {
        Self { image: Some(image) }
    }

    /// Keys held by the captured view (0 once released)
    pub fn len(&self) -> usize {
        self.image.as_ref().map_or(0, |image| image.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FsmSnapshot for KvSnapshot {
    fn persist(&mut self, sink: &mut dyn SnapshotSink) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| LedgerError::Snapshot("snapshot already released".to_string()))?;

        let bytes = image.write_to(sink)?;
        debug!(id = sink.id(), keys = image.len(), bytes, "snapshot persisted");
        Ok(())
    }

    fn release(&mut self) {
        self.image = None;
    }
}
