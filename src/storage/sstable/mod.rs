//! SSTable Module
//!
//! Sorted String Table - immutable on-disk sorted key-value storage.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "LDKV" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Key][Value]                │
//! │   ... repeated for each entry ...                       │
//! │   (ValLen = u32::MAX means tombstone, no value bytes)   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Offset: u64][Key]                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   IndexOffset: u64 (8) | DataCRC: u32 (4) | Padding (4) │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The data-block record layout is shared with the backup image
//! (see [`crate::storage::image`]).

mod builder;
mod iterator;
mod reader;

use std::io::Read;
use std::path::PathBuf;

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;

use crate::error::{LedgerError, Result};

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a LedgerKV SSTable file
pub(crate) const MAGIC: &[u8; 4] = b"LDKV";

/// Current SSTable format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + DataCRC (4) + Padding (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

/// Sentinel value indicating a tombstone (deleted key)
pub(crate) const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Size of a record header: KeyLen (4) + ValLen (4)
pub(crate) const RECORD_HEADER_SIZE: usize = 8;

// =============================================================================
// Record Encoding
// =============================================================================

/// Encode one data record; `None` value writes a tombstone
pub(crate) fn encode_record(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let val_len = value.map(|v| v.len() as u32).unwrap_or(TOMBSTONE_MARKER);
    let mut out =
        Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.map_or(0, |v| v.len()));
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&val_len.to_le_bytes());
    out.extend_from_slice(key);
    if let Some(v) = value {
        out.extend_from_slice(v);
    }
    out
}

/// Split a record header into (key_len, val_len)
pub(crate) fn parse_record_header(header: &[u8; RECORD_HEADER_SIZE]) -> (usize, u32) {
    let mut key_len = [0u8; 4];
    key_len.copy_from_slice(&header[0..4]);
    let mut val_len = [0u8; 4];
    val_len.copy_from_slice(&header[4..8]);
    (u32::from_le_bytes(key_len) as usize, u32::from_le_bytes(val_len))
}

/// A decoded record with the exact bytes it occupied (for checksumming)
pub(crate) struct RawRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub encoded_len: u64,
}

/// Read the remainder of a record whose header has already been consumed
pub(crate) fn read_record_body<R: Read>(
    input: &mut R,
    header: &[u8; RECORD_HEADER_SIZE],
    hasher: Option<&mut crc32fast::Hasher>,
) -> Result<RawRecord> {
    let (key_len, val_len) = parse_record_header(header);

    let mut key = vec![0u8; key_len];
    input.read_exact(&mut key)?;

    let value = if val_len == TOMBSTONE_MARKER {
        None
    } else {
        let mut v = vec![0u8; val_len as usize];
        input.read_exact(&mut v)?;
        Some(v)
    };

    if let Some(hasher) = hasher {
        hasher.update(header);
        hasher.update(&key);
        if let Some(v) = &value {
            hasher.update(v);
        }
    }

    let encoded_len =
        (RECORD_HEADER_SIZE + key.len() + value.as_ref().map_or(0, |v| v.len())) as u64;
    Ok(RawRecord {
        key,
        value,
        encoded_len,
    })
}

pub(crate) fn le_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::Storage(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(arr))
}

pub(crate) fn le_u32(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| LedgerError::Storage(format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_le_bytes(arr))
}

// =============================================================================
// SSTable Metadata
// =============================================================================

/// SSTable metadata returned by [`SSTableBuilder::finish`]
#[derive(Debug, Clone)]
pub struct SSTable {
    /// Path to the SSTable file
    pub path: PathBuf,
    /// Number of entries in this SSTable
    pub entry_count: u64,
    /// Smallest key (for range filtering)
    pub min_key: Vec<u8>,
    /// Largest key (for range filtering)
    pub max_key: Vec<u8>,
    /// File size in bytes
    pub file_size: u64,
}

impl SSTable {
    /// Get the number of entries
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Quick check if a key might be in this SSTable (range check)
    /// Returns false if key is definitely outside [min_key, max_key]
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.entry_count > 0 && key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}
