//! Peer Book
//!
//! Raft addresses of cluster members, kept next to the raft log so a
//! restarted node can reach its peers before any of them contacts it.
//! Rewritten whole (temp file + rename) whenever an address changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

pub const PEERS_FILE: &str = "peers.json";

#[derive(Debug)]
pub struct PeerBook {
    path: PathBuf,
    addrs: BTreeMap<u64, String>,
}

impl PeerBook {
    /// Load the book from `dir`, starting empty when there is none
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PEERS_FILE);
        let addrs = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), peers = addrs.len(), "peer book loaded");
        Ok(Self { path, addrs })
    }

    pub fn get(&self, id: u64) -> Option<&String> {
        self.addrs.get(&id)
    }

    pub fn addrs(&self) -> &BTreeMap<u64, String> {
        &self.addrs
    }

    /// Record an address; persists only when it changed
    pub fn insert(&mut self, id: u64, addr: &str) {
        if self.addrs.get(&id).map(String::as_str) == Some(addr) {
            return;
        }
        self.addrs.insert(id, addr.to_string());
        self.save();
    }

    pub fn remove(&mut self, id: u64) {
        if self.addrs.remove(&id).is_some() {
            self.save();
        }
    }

    /// A lost write only costs rediscovery, so failures are logged
    fn save(&self) {
        if let Err(e) = self.write() {
            warn!(path = %self.path.display(), error = %e, "cannot persist peer book");
        }
    }

    fn write(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.addrs)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_addresses_survive_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut book = PeerBook::load(dir.path()).unwrap();
            book.insert(1, "127.0.0.1:7001");
            book.insert(2, "127.0.0.1:7002");
            book.remove(1);
        }

        let book = PeerBook::load(dir.path()).unwrap();
        assert_eq!(book.get(1), None);
        assert_eq!(book.get(2).map(String::as_str), Some("127.0.0.1:7002"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let book = PeerBook::load(dir.path()).unwrap();
        assert!(book.addrs().is_empty());
        assert!(!dir.path().join(PEERS_FILE).exists());
    }
}
