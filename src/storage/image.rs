//! Backup Image
//!
//! A self-contained, point-in-time copy of every live key in the engine,
//! used for raft snapshots.
//!
//! ## Stream Format
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Magic "LDKB" (4) | Version u16 (2)            │
//! ├───────────────────────────────────────────────┤
//! │ [KeyLen u32][ValLen u32][Key][Value] ...      │  ascending keys,
//! │                                               │  SSTable record layout
//! ├───────────────────────────────────────────────┤
//! │ End marker: KeyLen = u32::MAX, ValLen = 0     │
//! │ Count u64 (8) | CRC32 of all records (4)      │
//! └───────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{LedgerError, Result};

use super::sstable::{
    encode_record, le_u32, le_u64, parse_record_header, read_record_body, RECORD_HEADER_SIZE,
};

pub(crate) const IMAGE_MAGIC: &[u8; 4] = b"LDKB";
pub(crate) const IMAGE_VERSION: u16 = 1;
const END_MARKER: u32 = u32::MAX;

/// Live contents of the engine captured at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineImage {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl EngineImage {
    pub fn new(entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    pub fn entries(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.entries
    }

    /// Stream the image, returning the number of bytes written
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<u64> {
        let mut written = 0u64;
        let mut hasher = crc32fast::Hasher::new();

        out.write_all(IMAGE_MAGIC)?;
        out.write_all(&IMAGE_VERSION.to_le_bytes())?;
        written += 6;

        for (key, value) in &self.entries {
            let record = encode_record(key, Some(value));
            out.write_all(&record)?;
            hasher.update(&record);
            written += record.len() as u64;
        }

        out.write_all(&END_MARKER.to_le_bytes())?;
        out.write_all(&0u32.to_le_bytes())?;
        out.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        out.write_all(&hasher.finalize().to_le_bytes())?;
        out.flush()?;
        written += 20;

        Ok(written)
    }

    /// Read a whole image into memory
    pub fn read_from<R: Read>(input: R) -> Result<Self> {
        let mut reader = ImageReader::new(input)?;
        let mut entries = BTreeMap::new();
        loop {
            let batch = reader.next_batch(1024)?;
            if batch.is_empty() {
                break;
            }
            entries.extend(batch);
        }
        Ok(Self { entries })
    }
}

/// Incremental reader that yields an image in bounded batches
pub struct ImageReader<R> {
    input: R,
    hasher: crc32fast::Hasher,
    count: u64,
    last_key: Option<Vec<u8>>,
    finished: bool,
}

impl<R: Read> ImageReader<R> {
    /// Consume and validate the image header
    pub fn new(mut input: R) -> Result<Self> {
        let mut header = [0u8; 6];
        input.read_exact(&mut header)?;
        if &header[0..4] != IMAGE_MAGIC {
            return Err(LedgerError::Snapshot(format!(
                "not a backup image (magic {:?})",
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != IMAGE_VERSION {
            return Err(LedgerError::Snapshot(format!(
                "unsupported image version {}",
                version
            )));
        }

        Ok(Self {
            input,
            hasher: crc32fast::Hasher::new(),
            count: 0,
            last_key: None,
            finished: false,
        })
    }

    /// Next batch of at most `max` records; empty once the trailer verified
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut batch = Vec::new();
        while !self.finished && batch.len() < max.max(1) {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            self.input.read_exact(&mut header)?;

            let (key_len, _) = parse_record_header(&header);
            if key_len as u32 == END_MARKER {
                self.finish()?;
                break;
            }

            let record = read_record_body(&mut self.input, &header, Some(&mut self.hasher))?;
            let value = record.value.ok_or_else(|| {
                LedgerError::Snapshot("tombstone inside backup image".to_string())
            })?;
            if let Some(last) = &self.last_key {
                if record.key <= *last {
                    return Err(LedgerError::Snapshot(
                        "backup image keys out of order".to_string(),
                    ));
                }
            }
            self.last_key = Some(record.key.clone());
            self.count += 1;
            batch.push((record.key, value));
        }
        Ok(batch)
    }

    /// Records read so far
    pub fn count(&self) -> u64 {
        self.count
    }

    fn finish(&mut self) -> Result<()> {
        let mut trailer = [0u8; 12];
        self.input.read_exact(&mut trailer)?;
        let count = le_u64(&trailer[0..8])?;
        let crc = le_u32(&trailer[8..12])?;

        if count != self.count {
            return Err(LedgerError::Snapshot(format!(
                "backup image announced {} records, read {}",
                count, self.count
            )));
        }
        let actual = self.hasher.clone().finalize();
        if crc != actual {
            return Err(LedgerError::Snapshot(format!(
                "backup image checksum mismatch: expected {:08x}, got {:08x}",
                crc, actual
            )));
        }
        self.finished = true;
        Ok(())
    }
}
