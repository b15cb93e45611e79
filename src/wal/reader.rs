//! WAL Reader
//!
//! Handles reading entries from the WAL file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::{parse_header, HEADER_SIZE};
use super::{Operation, WalEntry};
use crate::error::{LedgerError, Result};

/// Reads entries from the WAL file
pub struct WalReader<T = Operation> {
    reader: BufReader<File>,

    /// Byte offset just past the last entry that decoded cleanly
    position: u64,

    _record: PhantomData<T>,
}

impl<T> WalReader<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            _record: PhantomData,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// - `Ok(Some(entry))`: a valid entry
    /// - `Ok(None)`: clean end of file
    /// - `Err(WalCorruption)`: torn tail or checksum failure
    pub fn next_entry(&mut self) -> Result<Option<WalEntry<T>>> {
        let mut header = [0u8; HEADER_SIZE];
        let read = read_full(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(LedgerError::WalCorruption(format!(
                "partial header at offset {} ({} bytes)",
                self.position, read
            )));
        }

        let header = parse_header(&header)?;
        let mut body = vec![0u8; header.len];
        let read = read_full(&mut self.reader, &mut body)?;
        if read < header.len {
            return Err(LedgerError::WalCorruption(format!(
                "partial entry at offset {}: lsn {} has {} of {} bytes",
                self.position, header.lsn, read, header.len
            )));
        }

        let entry = WalEntry::decode_body(header, &body)?;
        self.position += (HEADER_SIZE + header.len) as u64;
        Ok(Some(entry))
    }

    /// Offset of the end of the valid prefix read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Iterate over all valid entries (stops after the first error)
    pub fn entries(self) -> WalIterator<T> {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries
pub struct WalIterator<T = Operation> {
    reader: WalReader<T>,
    done: bool,
}

impl<T> Iterator for WalIterator<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = Result<WalEntry<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the file allows, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
