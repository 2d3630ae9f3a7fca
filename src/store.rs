//! Persistent session storage.
//!
//! History rasters are stored one entry per history index; the small session
//! descriptor (`PersistedSession`) is stored separately. The history store
//! only talks to the [`SessionStore`] trait, so tests can inject the
//! in-memory implementation (with failure injection) while the application
//! uses the file-backed one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::components::history::HistoryEntry;
use crate::io::{self, CodecError, ExportFormat};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded ({needed} bytes needed, {available} available)")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StoreError::Serialize(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Small descriptor persisted next to the raster entries.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub history_length: usize,
    pub history_index: usize,
    pub active_tool: String,
    pub prompt: String,
}

/// Key/value store for history entries, keyed by history index.
pub trait SessionStore: Send {
    fn put(&mut self, index: usize, entry: &HistoryEntry) -> StoreResult<()>;

    fn get(&self, index: usize) -> StoreResult<Option<HistoryEntry>>;

    /// Entries present in `range`, in index order. Missing indices are
    /// skipped, so callers compare the returned count against what they
    /// expected.
    fn get_range(&self, range: Range<usize>) -> StoreResult<Vec<HistoryEntry>> {
        let mut out = Vec::with_capacity(range.len());
        for index in range {
            if let Some(entry) = self.get(index)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Delete every entry at or after `index`.
    fn remove_from(&mut self, index: usize) -> StoreResult<()>;

    /// Delete all entries and the descriptor.
    fn clear(&mut self) -> StoreResult<()>;

    fn save_descriptor(&mut self, descriptor: &PersistedSession) -> StoreResult<()>;

    fn load_descriptor(&self) -> StoreResult<Option<PersistedSession>>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Failure to inject into the next write of a [`MemorySessionStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectedFailure {
    Quota,
    Unavailable,
    /// Only descriptor writes fail; entries are still stored.
    DescriptorOnly,
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<usize, HistoryEntry>,
    descriptor: Option<PersistedSession>,
    fail_writes: Option<InjectedFailure>,
    quota_bytes: Option<u64>,
}

/// In-memory store. Clones share the same backing map, so a test can keep a
/// handle to inspect or sabotage a store that was moved into a history.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total stored pixel bytes, mimicking a browser storage quota.
    pub fn with_quota(quota_bytes: u64) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.quota_bytes = Some(quota_bytes);
        }
        store
    }

    /// Make every write fail with `failure` until cleared with `None`.
    pub fn fail_writes(&self, failure: Option<InjectedFailure>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = failure;
        }
    }

    pub fn indices(&self) -> Vec<usize> {
        self.inner
            .lock()
            .map(|inner| inner.entries.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Remove a single entry behind the history's back (simulates a store
    /// evicting data).
    pub fn evict(&self, index: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.remove(&index);
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl MemoryInner {
    fn check_write(&self, extra_bytes: u64, descriptor: bool) -> StoreResult<()> {
        match self.fail_writes {
            Some(InjectedFailure::Quota) => {
                return Err(StoreError::QuotaExceeded {
                    needed: extra_bytes,
                    available: 0,
                });
            }
            Some(InjectedFailure::Unavailable) => {
                return Err(StoreError::Unavailable("storage disabled".into()));
            }
            Some(InjectedFailure::DescriptorOnly) if descriptor => {
                return Err(StoreError::Unavailable("descriptor writes disabled".into()));
            }
            Some(InjectedFailure::DescriptorOnly) | None => {}
        }
        if let Some(quota) = self.quota_bytes {
            let used: u64 = self.entries.values().map(|e| e.raster.memory_bytes() as u64).sum();
            let available = quota.saturating_sub(used);
            if extra_bytes > available {
                return Err(StoreError::QuotaExceeded {
                    needed: extra_bytes,
                    available,
                });
            }
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&mut self, index: usize, entry: &HistoryEntry) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let replaced = inner
            .entries
            .get(&index)
            .map(|e| e.raster.memory_bytes() as u64)
            .unwrap_or(0);
        let needed = (entry.raster.memory_bytes() as u64).saturating_sub(replaced);
        inner.check_write(needed, false)?;
        inner.entries.insert(index, entry.clone());
        Ok(())
    }

    fn get(&self, index: usize) -> StoreResult<Option<HistoryEntry>> {
        Ok(self.lock()?.entries.get(&index).cloned())
    }

    fn remove_from(&mut self, index: usize) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let _removed = inner.entries.split_off(&index);
        Ok(())
    }

    fn clear(&mut self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.entries.clear();
        inner.descriptor = None;
        Ok(())
    }

    fn save_descriptor(&mut self, descriptor: &PersistedSession) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_write(0, true)?;
        inner.descriptor = Some(descriptor.clone());
        Ok(())
    }

    fn load_descriptor(&self) -> StoreResult<Option<PersistedSession>> {
        Ok(self.lock()?.descriptor.clone())
    }
}

// ============================================================================
// FILE-BACKED STORE
// ============================================================================

const ENTRY_MAGIC: &str = "RFE1";
const DESCRIPTOR_FILE: &str = "session.json";

/// On-disk layout of one history entry (bincode).
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    magic: String,
    label: String,
    width: u32,
    height: u32,
    /// PNG-encoded pixels.
    png: Vec<u8>,
}

/// One directory per session: `entry_00000.bin`, `entry_00001.bin`, … plus
/// `session.json` for the descriptor.
pub struct FileSessionStore {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileSessionStore {
    /// Open (creating if needed) the store for `session_id` under `root`.
    pub fn open(root: &Path, session_id: Uuid) -> StoreResult<Self> {
        Self::open_dir(root.join(session_id.to_string()))
    }

    pub fn open_dir(dir: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&dir).map_err(map_io)?;
        Ok(Self { dir, quota_bytes: None })
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("entry_{:05}.bin", index))
    }

    /// Indices of all entry files currently on disk.
    pub fn stored_indices(&self) -> StoreResult<Vec<usize>> {
        let mut indices = Vec::new();
        for dirent in fs::read_dir(&self.dir).map_err(map_io)? {
            let dirent = dirent.map_err(map_io)?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix("entry_")
                .and_then(|rest| rest.strip_suffix(".bin"))
                .and_then(|digits| digits.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn used_bytes(&self) -> StoreResult<u64> {
        let mut total = 0;
        for dirent in fs::read_dir(&self.dir).map_err(map_io)? {
            total += dirent.map_err(map_io)?.metadata().map_err(map_io)?.len();
        }
        Ok(total)
    }

    /// Write `bytes` to `path` via a temp file + rename, so a failed write
    /// never leaves a truncated entry behind.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(quota) = self.quota_bytes {
            let replaced = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            let available = quota.saturating_sub(self.used_bytes()?.saturating_sub(replaced));
            if bytes.len() as u64 > available {
                return Err(StoreError::QuotaExceeded {
                    needed: bytes.len() as u64,
                    available,
                });
            }
        }
        let tmp = path.with_extension("tmp");
        let result = (|| -> StoreResult<()> {
            let file = File::create(&tmp).map_err(map_io)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(bytes).map_err(map_io)?;
            writer.flush().map_err(map_io)?;
            fs::rename(&tmp, path).map_err(map_io)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

/// Out-of-space conditions surface as quota errors so callers can tell them
/// apart from generic I/O failures.
fn map_io(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::StorageFull => StoreError::QuotaExceeded {
            needed: 0,
            available: 0,
        },
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Io(e),
    }
}

impl SessionStore for FileSessionStore {
    fn put(&mut self, index: usize, entry: &HistoryEntry) -> StoreResult<()> {
        let png = io::encode(&entry.raster, ExportFormat::Png, io::DEFAULT_QUALITY)?;
        let stored = StoredEntry {
            magic: ENTRY_MAGIC.to_string(),
            label: entry.label.clone(),
            width: entry.raster.width(),
            height: entry.raster.height(),
            png,
        };
        let bytes = bincode::serialize(&stored)?;
        self.write_atomic(&self.entry_path(index), &bytes)?;
        debug!(index, bytes = bytes.len(), dir = %self.dir.display(), "stored history entry");
        Ok(())
    }

    fn get(&self, index: usize) -> StoreResult<Option<HistoryEntry>> {
        let path = self.entry_path(index);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(map_io(e)),
        };
        let stored: StoredEntry = bincode::deserialize_from(BufReader::new(file))?;
        if stored.magic != ENTRY_MAGIC {
            return Err(StoreError::Serialize(format!(
                "entry {} has unknown magic '{}'",
                index, stored.magic
            )));
        }
        let raster = io::decode(&stored.png)?;
        if raster.dimensions() != (stored.width, stored.height) {
            warn!(index, "stored entry dimensions do not match its pixels");
            return Ok(None);
        }
        Ok(Some(HistoryEntry::new(raster, stored.label)))
    }

    fn remove_from(&mut self, index: usize) -> StoreResult<()> {
        for stored in self.stored_indices()? {
            if stored >= index {
                match fs::remove_file(self.entry_path(stored)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(map_io(e)),
                }
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.remove_from(0)?;
        match fs::remove_file(self.dir.join(DESCRIPTOR_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    fn save_descriptor(&mut self, descriptor: &PersistedSession) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(descriptor)?;
        self.write_atomic(&self.dir.join(DESCRIPTOR_FILE), &bytes)
    }

    fn load_descriptor(&self) -> StoreResult<Option<PersistedSession>> {
        match fs::read(self.dir.join(DESCRIPTOR_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }
}
