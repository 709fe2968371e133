//! Persistent read-offset tracking for tailed files.
//!
//! An in-memory map with write-behind persistence: mutations mark entries
//! dirty, and a flush serializes a snapshot taken under the lock and writes
//! it outside the lock, atomically replacing a single self-describing JSON
//! file (write-new-then-rename).

use std::{
    collections::BTreeMap,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use common::runtime::UnixTimestamp;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

use crate::metrics::{
    log_offset_tombstones_purged,
    offset_flush_timer,
};

const OFFSET_FILE_VERSION: u32 = 1;

/// Identity of an open file, used to tell appends from rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSourceState {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub offset: u64,
    pub last_read: UnixTimestamp,
    /// Set when the path is untracked; the entry survives until the
    /// tombstone retention elapses so a re-added path resumes its offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_at: Option<UnixTimestamp>,
}

#[derive(Serialize, Deserialize)]
struct OffsetFileSchema {
    version: u32,
    files: BTreeMap<String, FileSourceState>,
}

struct OffsetInner {
    entries: BTreeMap<String, FileSourceState>,
    dirty: usize,
}

pub struct OffsetStore {
    path: PathBuf,
    inner: Mutex<OffsetInner>,
}

impl OffsetStore {
    /// Load the store from disk, starting empty when the file does not
    /// exist yet. A file with an unknown schema version is an error rather
    /// than silently dropped offsets.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let schema: OffsetFileSchema = serde_json::from_slice(&bytes)?;
                anyhow::ensure!(
                    schema.version == OFFSET_FILE_VERSION,
                    "Unsupported offset file version {} in {:?}",
                    schema.version,
                    path
                );
                schema.files
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(OffsetInner { entries, dirty: 0 }),
        })
    }

    pub fn get(&self, source_id: &str) -> Option<FileSourceState> {
        self.inner.lock().entries.get(source_id).cloned()
    }

    /// Record progress for a source. Returns the current dirty count so the
    /// caller can decide whether a flush is due.
    pub fn update(&self, source_id: &str, state: FileSourceState) -> usize {
        let mut inner = self.inner.lock();
        inner.entries.insert(source_id.to_owned(), state);
        inner.dirty += 1;
        inner.dirty
    }

    /// Mark a source as untracked; its offset is retained until the
    /// tombstone retention elapses.
    pub fn tombstone(&self, source_id: &str, now: UnixTimestamp) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(source_id) {
            state.tombstone_at = Some(now);
            inner.dirty += 1;
        }
    }

    /// Clear a tombstone when a previously removed path is tracked again.
    pub fn resurrect(&self, source_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(source_id) {
            if state.tombstone_at.take().is_some() {
                inner.dirty += 1;
            }
        }
    }

    /// Drop entries whose tombstone is older than `retention`.
    pub fn purge_tombstones(&self, now: UnixTimestamp, retention: Duration) {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, state| match state.tombstone_at {
            Some(tombstoned) => now.checked_sub(tombstoned).map_or(true, |age| age < retention),
            None => true,
        });
        let purged = before - inner.entries.len();
        if purged > 0 {
            inner.dirty += purged;
            log_offset_tombstones_purged(purged);
        }
    }

    /// Consistent view of all current offsets, for diagnostics.
    pub fn snapshot(&self) -> BTreeMap<String, FileSourceState> {
        self.inner.lock().entries.clone()
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty
    }

    /// Serialize a snapshot and atomically replace the on-disk file. The
    /// write happens outside the map lock.
    pub fn flush(&self) -> anyhow::Result<()> {
        let (files, dirty_at_snapshot) = {
            let inner = self.inner.lock();
            (inner.entries.clone(), inner.dirty)
        };
        if dirty_at_snapshot == 0 {
            return Ok(());
        }
        let _timer = offset_flush_timer();
        let schema = OffsetFileSchema {
            version: OFFSET_FILE_VERSION,
            files,
        };
        write_atomically(&self.path, &serde_json::to_vec_pretty(&schema)?)?;
        {
            let mut inner = self.inner.lock();
            inner.dirty = inner.dirty.saturating_sub(dirty_at_snapshot);
        }
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
