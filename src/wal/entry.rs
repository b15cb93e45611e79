//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their on-disk framing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Entry header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single entry body; anything larger is treated as corruption
pub const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// A single entry in the WAL
///
/// `T` is the logged record. The storage engine logs [`Operation`]s; the raft
/// log store logs its own record type through the same framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry<T = Operation> {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// The logged record
    pub payload: T,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations the storage engine logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },
}

impl<T> WalEntry<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create an entry stamped with the current time
    pub fn new(lsn: u64, payload: T) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            lsn,
            payload,
            timestamp,
        }
    }

    /// Encode as `[lsn][crc][len][body]`, crc covering lsn + body
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(&(self.timestamp, &self.payload))?;
        if body.len() > MAX_ENTRY_SIZE {
            return Err(LedgerError::WalWrite(format!(
                "entry of {} bytes exceeds limit of {}",
                body.len(),
                MAX_ENTRY_SIZE
            )));
        }

        let crc = Self::compute_crc(self.lsn, &body);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a single entry from the start of `bytes`
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Self::decode_prefix(bytes).map(|(entry, _)| entry)
    }

    /// Decode the entry at the start of `bytes`, returning it with its framed size
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = parse_header(bytes)?;
        let total = HEADER_SIZE + header.len;
        if bytes.len() < total {
            return Err(LedgerError::WalCorruption(format!(
                "truncated entry at lsn {}: need {} bytes, have {}",
                header.lsn,
                total,
                bytes.len()
            )));
        }
        let entry = Self::decode_body(header, &bytes[HEADER_SIZE..total])?;
        Ok((entry, total))
    }

    pub(crate) fn decode_body(header: EntryHeader, body: &[u8]) -> Result<Self> {
        let actual = Self::compute_crc(header.lsn, body);
        if actual != header.crc {
            return Err(LedgerError::WalCorruption(format!(
                "CRC mismatch at lsn {}: expected {:08x}, got {:08x}",
                header.lsn, header.crc, actual
            )));
        }

        let (timestamp, payload): (u64, T) = bincode::deserialize(body)
            .map_err(|e| LedgerError::WalCorruption(format!("lsn {}: {}", header.lsn, e)))?;

        Ok(Self {
            lsn: header.lsn,
            payload,
            timestamp,
        })
    }

    fn compute_crc(lsn: u64, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_le_bytes());
        hasher.update(body);
        hasher.finalize()
    }
}

/// Parsed entry header
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: usize,
}

pub(crate) fn parse_header(bytes: &[u8]) -> Result<EntryHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(LedgerError::WalCorruption(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&bytes[0..8]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[8..12]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[12..16]);

    let header = EntryHeader {
        lsn: u64::from_le_bytes(lsn),
        crc: u32::from_le_bytes(crc),
        len: u32::from_le_bytes(len) as usize,
    };

    if header.len > MAX_ENTRY_SIZE {
        return Err(LedgerError::WalCorruption(format!(
            "entry length {} at lsn {} exceeds limit",
            header.len, header.lsn
        )));
    }
    Ok(header)
}
