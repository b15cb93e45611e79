//! Tests for MemTable
//!
//! These tests verify:
//! - Put/get/delete semantics and tombstones
//! - Size accounting used for flush decisions
//! - Sorted iteration for flushes and backups
//! - Concurrent readers alongside a writer

use std::sync::Arc;
use std::thread;

use ledgerkv::memtable::{MemTable, MemTableEntry};

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_then_get() {
    let table = MemTable::new();
    table.put(b"alpha".to_vec(), b"1".to_vec());

    assert_eq!(
        table.get(b"alpha"),
        Some(MemTableEntry::Value(b"1".to_vec()))
    );
    assert_eq!(table.get(b"beta"), None);
}

#[test]
fn test_overwrite_keeps_latest_value() {
    let table = MemTable::new();
    table.put(b"k".to_vec(), b"old".to_vec());
    table.put(b"k".to_vec(), b"new".to_vec());

    assert_eq!(table.get(b"k"), Some(MemTableEntry::Value(b"new".to_vec())));
    assert_eq!(table.entry_count(), 1);
}

#[test]
fn test_delete_leaves_tombstone() {
    let table = MemTable::new();
    table.put(b"k".to_vec(), b"v".to_vec());
    table.delete(b"k".to_vec());

    assert_eq!(table.get(b"k"), Some(MemTableEntry::Tombstone));
    assert!(!table.is_empty());
}

#[test]
fn test_delete_of_unknown_key_still_masks_older_data() {
    let table = MemTable::new();
    table.delete(b"never-written".to_vec());

    assert_eq!(table.get(b"never-written"), Some(MemTableEntry::Tombstone));
}

// =============================================================================
// Size Accounting
// =============================================================================

#[test]
fn test_size_counts_key_and_value_bytes() {
    let table = MemTable::new();
    let size = table.put(b"abc".to_vec(), b"12345".to_vec());
    assert_eq!(size, 8);
    assert_eq!(table.size(), 8);
}

#[test]
fn test_size_after_overwrite_and_delete() {
    let table = MemTable::new();
    table.put(b"abc".to_vec(), b"12345".to_vec());
    assert_eq!(table.put(b"abc".to_vec(), b"1".to_vec()), 4);

    // Tombstones count their key only
    assert_eq!(table.delete(b"abc".to_vec()), 3);
}

#[test]
fn test_should_flush_at_limit() {
    let table = MemTable::new();
    table.put(vec![0u8; 10], vec![0u8; 10]);

    assert!(table.should_flush(20));
    assert!(!table.should_flush(21));
}

#[test]
fn test_clear_resets_everything() {
    let table = MemTable::new();
    table.put(b"a".to_vec(), b"1".to_vec());
    table.delete(b"b".to_vec());

    table.clear();

    assert!(table.is_empty());
    assert_eq!(table.size(), 0);
    assert_eq!(table.get(b"a"), None);
}

// =============================================================================
// Iteration
// =============================================================================

#[test]
fn test_iter_is_sorted_and_includes_tombstones() {
    let table = MemTable::new();
    table.put(b"c".to_vec(), b"3".to_vec());
    table.put(b"a".to_vec(), b"1".to_vec());
    table.delete(b"b".to_vec());

    let entries = table.iter();
    let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();

    assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    assert_eq!(entries[1].1, MemTableEntry::Tombstone);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_readers_see_committed_writes() {
    let table = Arc::new(MemTable::new());
    for i in 0..100u32 {
        table.put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec());
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..100u32 {
                    assert_eq!(
                        table.get(&i.to_be_bytes()),
                        Some(MemTableEntry::Value(i.to_le_bytes().to_vec()))
                    );
                }
            })
        })
        .collect();

    let writer = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for i in 100..200u32 {
                table.put(i.to_be_bytes().to_vec(), vec![1]);
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
    assert_eq!(table.entry_count(), 200);
}
