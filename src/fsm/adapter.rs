//! Storage adapter
//!
//! Narrow get/set/delete surface over the engine. Values are stored as JSON
//! bytes so any JSON document round-trips unchanged.

use std::sync::Arc;

use serde_json::Value;

use crate::engine::Engine;
use crate::error::Result;

/// JSON-valued view of the storage engine
///
/// Each call is one engine operation, so a failure leaves nothing behind.
#[derive(Clone)]
pub struct StoreAdapter {
    engine: Arc<Engine>,
}

impl StoreAdapter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// `Ok(None)` when the key does not exist
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.engine.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.engine.put(key.as_bytes(), &bytes)
    }

    /// Deleting a missing key succeeds
    pub fn delete(&self, key: &str) -> Result<()> {
        self.engine.delete(key.as_bytes())
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn adapter() -> (TempDir, StoreAdapter) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open_path(dir.path()).unwrap();
        (dir, StoreAdapter::new(Arc::new(engine)))
    }

    #[test]
    fn test_json_values_roundtrip() {
        let (_dir, store) = adapter();
        let doc = json!({"name": "ada", "tags": ["x", "y"], "n": 3.5});

        store.set("doc", &doc).unwrap();
        store.set("text", &json!("plain")).unwrap();

        assert_eq!(store.get("doc").unwrap(), Some(doc));
        assert_eq!(store.get("text").unwrap(), Some(json!("plain")));
    }

    #[test]
    fn test_missing_key_is_none() {
        let (_dir, store) = adapter();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = adapter();
        store.set("k", &json!(1)).unwrap();

        store.delete("k").unwrap();
        store.delete("k").unwrap();
        store.delete("never-existed").unwrap();

        assert_eq!(store.get("k").unwrap(), None);
    }
}
