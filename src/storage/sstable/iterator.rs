//! SSTable Iterator
//!
//! Sequential iteration over all entries in an SSTable.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use crate::error::Result;

use super::{read_record_body, HEADER_SIZE, RECORD_HEADER_SIZE};

/// Iterator over SSTable entries in sorted key order
pub struct SSTableIterator<'a> {
    file: &'a mut BufReader<File>,
    /// Start of the index block; the data block ends here
    end_offset: u64,
    current_offset: u64,
    failed: bool,
}

impl<'a> SSTableIterator<'a> {
    pub(super) fn new(file: &'a mut BufReader<File>, end_offset: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: HEADER_SIZE,
            failed: false,
        })
    }
}

impl<'a> Iterator for SSTableIterator<'a> {
    /// (key, Option<value>): None value means tombstone
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.current_offset >= self.end_offset {
            return None;
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        if let Err(e) = self.file.read_exact(&mut header) {
            self.failed = true;
            return Some(Err(e.into()));
        }

        match read_record_body(&mut *self.file, &header, None) {
            Ok(record) => {
                self.current_offset += record.encoded_len;
                Some(Ok((record.key, record.value)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
