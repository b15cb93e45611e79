//! Tests for the key-value state machine
//!
//! These tests verify:
//! - SET / GET / DELETE application against a real engine
//! - Case-insensitive operations and skipped unknown commands
//! - Identical logs produce identical state
//! - Snapshot capture and restore

use std::io::Cursor;
use std::sync::Arc;

use ledgerkv::fsm::{write_snapshot, Command, KvStateMachine, StateMachine, StoreAdapter};
use ledgerkv::Engine;
use raft::eraftpb::Entry;
use serde_json::{json, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn state_machine() -> (TempDir, KvStateMachine) {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open_path(temp.path()).unwrap());
    (temp, KvStateMachine::new(StoreAdapter::new(engine)))
}

fn entry(index: u64, data: Vec<u8>) -> Entry {
    let mut entry = Entry::default();
    entry.index = index;
    entry.term = 1;
    entry.data = data.into();
    entry
}

fn command_entry(index: u64, command: &Command) -> Entry {
    entry(index, command.encode().unwrap())
}

fn snapshot_bytes(fsm: &mut KvStateMachine) -> Vec<u8> {
    let mut out = Vec::new();
    write_snapshot(fsm, &mut out).unwrap();
    out
}

// =============================================================================
// Apply Tests
// =============================================================================

#[test]
fn test_set_echoes_value_and_stores_it() {
    let (_temp, mut fsm) = state_machine();
    let value = json!({"name": "ledger", "tags": [1, 2]});

    let result = fsm
        .apply(&command_entry(1, &Command::set("k", value.clone())))
        .unwrap();

    assert!(result.is_ok());
    assert!(result.found);
    assert_eq!(result.data, value);
    assert_eq!(fsm.store().get("k").unwrap(), Some(value));
}

#[test]
fn test_get_hit_and_miss() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("present", json!(7))));

    let hit = fsm.apply(&command_entry(2, &Command::get("present"))).unwrap();
    assert!(hit.found);
    assert_eq!(hit.data, json!(7));

    let miss = fsm.apply(&command_entry(3, &Command::get("absent"))).unwrap();
    assert!(!miss.found);
    assert!(miss.is_ok());
    assert_eq!(miss.data, json!({}));
}

#[test]
fn test_get_distinguishes_stored_empty_object_from_miss() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("empty", json!({}))));

    let result = fsm.apply(&command_entry(2, &Command::get("empty"))).unwrap();
    assert!(result.found);
    assert_eq!(result.data, json!({}));
}

#[test]
fn test_delete_is_idempotent() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("k", json!("v"))));

    let first = fsm.apply(&command_entry(2, &Command::delete("k"))).unwrap();
    let second = fsm.apply(&command_entry(3, &Command::delete("k"))).unwrap();

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(first.data, Value::Null);
    assert_eq!(fsm.store().get("k").unwrap(), None);
}

#[test]
fn test_operation_names_ignore_case() {
    let (_temp, mut fsm) = state_machine();
    let raw = br#"{"operation": " set ", "key": "k", "value": "v"}"#.to_vec();

    let result = fsm.apply(&entry(1, raw)).unwrap();

    assert!(result.is_ok());
    assert_eq!(fsm.store().get("k").unwrap(), Some(json!("v")));
}

#[test]
fn test_unknown_operation_is_skipped() {
    let (_temp, mut fsm) = state_machine();
    let raw = br#"{"operation": "INCR", "key": "k", "value": 1}"#.to_vec();

    assert!(fsm.apply(&entry(1, raw)).is_none());
    assert_eq!(fsm.store().get("k").unwrap(), None);
}

#[test]
fn test_malformed_payload_is_skipped() {
    let (_temp, mut fsm) = state_machine();

    assert!(fsm.apply(&entry(1, b"not json".to_vec())).is_none());
    assert!(fsm.apply(&entry(2, br#"{"key": "k"}"#.to_vec())).is_none());
}

#[test]
fn test_same_log_gives_same_state() {
    let commands = vec![
        Command::set("a", json!(1)),
        Command::set("b", json!({"x": true})),
        Command::delete("a"),
        Command::set("c", json!([1, 2, 3])),
        Command::get("b"),
        Command::set("a", json!("again")),
    ];

    let (_t1, mut first) = state_machine();
    let (_t2, mut second) = state_machine();
    for (i, command) in commands.iter().enumerate() {
        let e = command_entry(i as u64 + 1, command);
        assert_eq!(first.apply(&e), second.apply(&e));
    }

    assert_eq!(snapshot_bytes(&mut first), snapshot_bytes(&mut second));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_snapshot_then_restore_into_other_machine() {
    let (_t1, mut source) = state_machine();
    source.apply(&command_entry(1, &Command::set("a", json!(1))));
    source.apply(&command_entry(2, &Command::set("b", json!("two"))));
    let bytes = snapshot_bytes(&mut source);

    let (_t2, mut target) = state_machine();
    target.apply(&command_entry(1, &Command::set("stale", json!(0))));
    target.restore(Box::new(Cursor::new(bytes))).unwrap();

    assert_eq!(target.store().get("a").unwrap(), Some(json!(1)));
    assert_eq!(target.store().get("b").unwrap(), Some(json!("two")));
    assert_eq!(target.store().get("stale").unwrap(), None);
}

#[test]
fn test_snapshot_is_point_in_time() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("k", json!("before"))));

    let mut captured = fsm.snapshot().unwrap();
    fsm.apply(&command_entry(2, &Command::set("k", json!("after"))));

    let mut bytes = Vec::new();
    {
        struct VecSink<'a>(&'a mut Vec<u8>);
        impl std::io::Write for VecSink<'_> {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl ledgerkv::fsm::SnapshotSink for VecSink<'_> {
            fn id(&self) -> &str {
                "test"
            }
            fn cancel(&mut self) -> ledgerkv::Result<()> {
                Ok(())
            }
        }
        captured.persist(&mut VecSink(&mut bytes)).unwrap();
        captured.release();
    }

    fsm.restore(Box::new(Cursor::new(bytes))).unwrap();
    assert_eq!(fsm.store().get("k").unwrap(), Some(json!("before")));
}

#[test]
fn test_restore_rejects_trailing_bytes() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("k", json!(1))));
    let mut bytes = snapshot_bytes(&mut fsm);
    bytes.extend_from_slice(b"junk");

    assert!(fsm.restore(Box::new(Cursor::new(bytes))).is_err());
}

#[test]
fn test_restore_of_corrupt_image_keeps_state() {
    let (_temp, mut fsm) = state_machine();
    fsm.apply(&command_entry(1, &Command::set("keep", json!(true))));
    let mut bytes = snapshot_bytes(&mut fsm);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x55;

    assert!(fsm.restore(Box::new(Cursor::new(bytes))).is_err());
    assert_eq!(fsm.store().get("keep").unwrap(), Some(json!(true)));
}
