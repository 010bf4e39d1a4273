use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::StoreError;

/// Snapshot file name in the cache directory
const SNAPSHOT_FILE: &str = "store.json";

/// Where the store snapshot is kept.
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot. Must be all-or-nothing.
    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Snapshot on disk, replaced atomically through a temp file and rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&self.path)?))
    }

    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = snapshot.len(), "Store snapshot written");
        Ok(())
    }
}

/// In-process snapshot with an optional byte quota.
#[derive(Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Option<Vec<u8>>>,
    quota: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            snapshot: Mutex::new(None),
            quota: Mutex::new(Some(quota)),
        }
    }

    /// Change the quota of a live backend, `None` for unlimited.
    pub fn set_quota(&self, quota: Option<usize>) {
        *self.quota.lock().unwrap_or_else(|e| e.into_inner()) = quota;
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, Vec::len)
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError> {
        if let Some(quota) = *self.quota.lock().unwrap_or_else(|e| e.into_inner()) {
            if snapshot.len() > quota {
                return Err(StoreError::QuotaExceeded {
                    needed: snapshot.len(),
                    quota,
                });
            }
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.to_vec());
        Ok(())
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load()
    }

    fn save(&self, snapshot: &[u8]) -> Result<(), StoreError> {
        (**self).save(snapshot)
    }
}
