//! File Snapshot Store
//!
//! Keeps raft snapshots on disk, newest `retain` only.
//!
//! ## Layout
//! ```text
//! {dir}/
//!   ├── 3-120-1718000000000/      <term>-<index>-<created millis>
//!   │     ├── meta.json            SnapshotMeta
//!   │     └── state.bin            state machine image
//!   └── 3-140-1718000060000.tmp/  being written, ignored and cleaned up
//! ```
//!
//! A snapshot becomes visible only when its temp directory is renamed.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message as ProstMessage;
use raft::eraftpb::{ConfState, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::fsm::SnapshotSink;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Metadata stored next to each snapshot image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    /// Last log index covered by the image
    pub index: u64,
    pub term: u64,
    /// Protobuf-encoded `ConfState` at `index`
    pub conf_state: Vec<u8>,
    /// Image size in bytes
    pub size: u64,
    /// CRC32 of the image
    pub crc: u32,
    pub created_ms: u64,
}

impl SnapshotMeta {
    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(ConfState::decode(&self.conf_state[..])?)
    }
}

/// Directory of snapshots
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open the store, removing snapshots that were never completed
    pub fn open(dir: &Path, retain: usize) -> Result<Self> {
        if retain == 0 {
            return Err(LedgerError::Config("snapshot retain must be >= 1".to_string()));
        }
        fs::create_dir_all(dir)?;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .map_or(false, |n| n.to_string_lossy().ends_with(TMP_SUFFIX));
            if path.is_dir() && is_tmp {
                warn!(path = %path.display(), "removing incomplete snapshot");
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            retain,
        })
    }

    /// Start a snapshot covering the log up to `index`
    pub fn create(&self, index: u64, term: u64, conf_state: &ConfState) -> Result<FileSnapshotSink> {
        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = format!("{}-{}-{}", term, index, created_ms);
        let tmp_dir = self.dir.join(format!("{}{}", id, TMP_SUFFIX));
        fs::create_dir_all(&tmp_dir)?;

        let file = File::create(tmp_dir.join(STATE_FILE))?;
        debug!(id = %id, "creating snapshot");

        Ok(FileSnapshotSink {
            meta: SnapshotMeta {
                id: id.clone(),
                index,
                term,
                conf_state: conf_state.encode_to_vec(),
                size: 0,
                crc: 0,
                created_ms,
            },
            final_dir: self.dir.join(&id),
            tmp_dir,
            store_dir: self.dir.clone(),
            retain: self.retain,
            writer: Some(BufWriter::new(file)),
            hasher: crc32fast::Hasher::new(),
            finished: false,
        })
    }

    /// Completed snapshots, newest first
    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        list_in(&self.dir)
    }

    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Open a snapshot image for reading
    pub fn open_image(&self, id: &str) -> Result<(SnapshotMeta, File)> {
        let dir = self.dir.join(id);
        let meta = read_meta(&dir)?;
        let file = File::open(dir.join(STATE_FILE))?;
        Ok((meta, file))
    }

    /// Newest snapshot as a raft message payload, image checked against its CRC
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let Some(meta) = self.latest_meta()? else {
            return Ok(None);
        };
        let (meta, mut file) = self.open_image(&meta.id)?;

        let mut data = Vec::with_capacity(meta.size as usize);
        file.read_to_end(&mut data)?;
        let crc = crc32fast::hash(&data);
        if crc != meta.crc || data.len() as u64 != meta.size {
            return Err(LedgerError::Snapshot(format!(
                "snapshot {} is damaged (crc {:08x}, expected {:08x})",
                meta.id, crc, meta.crc
            )));
        }

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let md = snapshot.mut_metadata();
        md.index = meta.index;
        md.term = meta.term;
        md.set_conf_state(meta.conf_state()?);
        Ok(Some(snapshot))
    }

    /// Store a snapshot received from the leader
    pub fn save(&self, snapshot: &Snapshot) -> Result<SnapshotMeta> {
        let md = snapshot.get_metadata();
        let mut sink = self.create(md.index, md.term, md.get_conf_state())?;
        if let Err(e) = sink.write_all(&snapshot.data[..]) {
            let _ = sink.cancel();
            return Err(e.into());
        }
        sink.close()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Snapshot being written; dropped without `close` it is discarded
pub struct FileSnapshotSink {
    meta: SnapshotMeta,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    store_dir: PathBuf,
    retain: usize,
    writer: Option<BufWriter<File>>,
    hasher: crc32fast::Hasher,
    finished: bool,
}

impl FileSnapshotSink {
    /// Make the snapshot visible and drop the ones beyond `retain`
    pub fn close(mut self) -> Result<SnapshotMeta> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| LedgerError::Snapshot("snapshot sink already closed".to_string()))?;
        let file = writer
            .into_inner()
            .map_err(|e| LedgerError::Snapshot(format!("flush snapshot image: {}", e)))?;
        file.sync_all()?;

        self.meta.crc = self.hasher.clone().finalize();
        let meta_json = serde_json::to_vec_pretty(&self.meta)?;
        fs::write(self.tmp_dir.join(META_FILE), meta_json)?;
        fs::rename(&self.tmp_dir, &self.final_dir)?;
        self.finished = true;

        info!(
            id = %self.meta.id,
            index = self.meta.index,
            bytes = self.meta.size,
            "snapshot stored"
        );
        reap(&self.store_dir, self.retain);
        Ok(self.meta.clone())
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "snapshot sink closed")
        })?;
        let n = writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.meta.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn cancel(&mut self) -> Result<()> {
        self.writer = None;
        self.finished = true;
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        debug!(id = %self.meta.id, "snapshot cancelled");
        Ok(())
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cancel();
        }
    }
}

fn read_meta(dir: &Path) -> Result<SnapshotMeta> {
    let bytes = fs::read(dir.join(META_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn list_in(dir: &Path) -> Result<Vec<SnapshotMeta>> {
    let mut metas = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !path.is_dir() || name.ends_with(TMP_SUFFIX) {
            continue;
        }
        match read_meta(&path) {
            Ok(meta) => metas.push(meta),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
        }
    }
    metas.sort_by(|a, b| {
        (b.index, b.term, b.created_ms).cmp(&(a.index, a.term, a.created_ms))
    });
    Ok(metas)
}

/// Delete everything past the newest `retain` snapshots
fn reap(dir: &Path, retain: usize) {
    let metas = match list_in(dir) {
        Ok(metas) => metas,
        Err(e) => {
            warn!(error = %e, "cannot list snapshots for retention");
            return;
        }
    };
    for old in metas.iter().skip(retain) {
        match fs::remove_dir_all(dir.join(&old.id)) {
            Ok(()) => debug!(id = %old.id, "reaped snapshot"),
            Err(e) => warn!(id = %old.id, error = %e, "failed to reap snapshot"),
        }
    }
}
