//! Storage Module
//!
//! Persistent storage layer using SSTable-like files.
//!
//! ## Responsibilities
//! - Persist flushed memtables to disk in sorted format
//! - Point lookups across tables, newest first
//! - Full merged scans for backup images
//! - Atomic replacement of all tables when a backup is restored
//!
//! File formats are documented in [`sstable`] and [`image`].

pub mod image;
mod manager;
mod sstable;

pub use image::{EngineImage, ImageReader};
pub use manager::{StagedTable, StorageManager};
pub use sstable::{SSTable, SSTableBuilder, SSTableIterator, SSTableReader};
