//! SSTable Reader
//!
//! Opens SSTable files and provides O(log n) key lookups via in-memory index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{LedgerError, Result};

use super::iterator::SSTableIterator;
use super::{
    le_u32, le_u64, parse_record_header, read_record_body, FOOTER_SIZE, HEADER_SIZE, MAGIC,
    RECORD_HEADER_SIZE, TOMBSTONE_MARKER, VERSION,
};

/// Reader for SSTable files with in-memory index for O(log n) lookups
pub struct SSTableReader {
    path: PathBuf,
    file: BufReader<File>,
    /// key → file offset of its record
    index: BTreeMap<Vec<u8>, u64>,
    entry_count: u64,
    /// Start of the index block (end of data)
    index_offset: u64,
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Validates header and data checksum, then loads the index into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(LedgerError::Storage(format!(
                "SSTable {} too small ({} bytes)",
                path.display(),
                file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(LedgerError::Storage(format!(
                "Invalid SSTable magic in {}: {:?}",
                path.display(),
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(LedgerError::Storage(format!(
                "Unsupported SSTable version: {}",
                version
            )));
        }
        let entry_count = le_u64(&header[6..14])?;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let index_offset = le_u64(&footer[0..8])?;
        let expected_crc = le_u32(&footer[8..12])?;

        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(LedgerError::Storage(format!(
                "SSTable {} has index offset {} outside the file",
                path.display(),
                index_offset
            )));
        }

        let mut reader = BufReader::new(file);
        Self::verify_data(&mut reader, index_offset, expected_crc, path)?;
        let index = Self::load_index(&mut reader, index_offset, file_size - FOOTER_SIZE)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: reader,
            index,
            entry_count,
            index_offset,
        })
    }

    fn verify_data(
        reader: &mut BufReader<File>,
        index_offset: u64,
        expected_crc: u32,
        path: &Path,
    ) -> Result<()> {
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = index_offset - HEADER_SIZE;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        let actual = hasher.finalize();
        if actual != expected_crc {
            return Err(LedgerError::Storage(format!(
                "SSTable {} data checksum mismatch: expected {:08x}, got {:08x}",
                path.display(),
                expected_crc,
                actual
            )));
        }
        Ok(())
    }

    /// Parse index entries `[key_len(4)][offset(8)][key]` up to `end`
    fn load_index(
        reader: &mut BufReader<File>,
        index_offset: u64,
        end: u64,
    ) -> Result<BTreeMap<Vec<u8>, u64>> {
        reader.seek(SeekFrom::Start(index_offset))?;
        let mut block = vec![0u8; (end - index_offset) as usize];
        reader.read_exact(&mut block)?;

        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < block.len() {
            if pos + 12 > block.len() {
                return Err(LedgerError::Storage("truncated SSTable index entry".to_string()));
            }
            let key_len = le_u32(&block[pos..pos + 4])? as usize;
            let offset = le_u64(&block[pos + 4..pos + 12])?;
            pos += 12;
            if pos + key_len > block.len() {
                return Err(LedgerError::Storage("truncated SSTable index key".to_string()));
            }
            index.insert(block[pos..pos + key_len].to_vec(), offset);
            pos += key_len;
        }
        Ok(index)
    }

    /// Get a value by key: O(log n) lookup via in-memory index
    ///
    /// Returns:
    /// - `Ok(Some(value))`: key found with value
    /// - `Ok(None)`: key found but is a tombstone (deleted)
    /// - `Err(KeyNotFound)`: key not in this SSTable
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let offset = match self.index.get(key) {
            Some(&off) => off,
            None => return Err(LedgerError::KeyNotFound),
        };

        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact(&mut header)?;

        let (_, val_len) = parse_record_header(&header);
        if val_len == TOMBSTONE_MARKER {
            // Skip reading the key; the index already matched it
            return Ok(None);
        }

        let record = read_record_body(&mut self.file, &header, None)?;
        Ok(record.value)
    }

    /// Get entry count
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the minimum key in this SSTable (for range filtering)
    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.keys().next().map(|k| k.as_slice())
    }

    /// Get the maximum key in this SSTable (for range filtering)
    pub fn max_key(&self) -> Option<&[u8]> {
        self.index.keys().next_back().map(|k| k.as_slice())
    }

    /// Quick check if a key might be in this SSTable (range check)
    pub fn might_contain(&self, key: &[u8]) -> bool {
        match (self.min_key(), self.max_key()) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false,
        }
    }

    /// Create an iterator over all entries (backups, debugging)
    pub fn iter(&mut self) -> Result<SSTableIterator<'_>> {
        SSTableIterator::new(&mut self.file, self.index_offset)
    }
}
