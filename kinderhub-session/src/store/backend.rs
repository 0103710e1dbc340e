//! Storage backends
//!
//! Origin-scoped key-value storage shared by every view attached to it.

use kinderhub_core::{storage_error, KinderhubError, KinderhubResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Identifies one view (tab, window, process) attached to a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(uuid::Uuid);

impl ViewId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ViewId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Native change notification emitted by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Keys touched by the change
    pub keys: Vec<String>,
    /// View that made the change
    pub origin: ViewId,
}

/// Durable key-value storage shared by the views of one origin
///
/// Multi-key writes and removals are applied as one unit and produce at most
/// one [`StorageChange`].
pub trait StorageBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> KinderhubResult<Option<String>>;

    fn set_many(&self, origin: ViewId, entries: &[(&str, String)]) -> KinderhubResult<()>;

    fn remove_many(&self, origin: ViewId, keys: &[&str]) -> KinderhubResult<()>;

    /// Subscribe to changes made through this backend, if it can report them
    fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        None
    }
}

const CHANGE_BUFFER: usize = 64;

/// In-process backend with a native change feed
///
/// Share one instance (behind an `Arc`) between views to model several tabs of
/// the same origin.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Store a raw value without going through a view; no change is emitted
    pub fn insert_raw(&self, key: &str, value: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, origin: ViewId, keys: Vec<String>) {
        // No receivers is fine: nobody else is listening
        let _ = self.changes.send(StorageChange { keys, origin });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> KinderhubResult<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set_many(&self, origin: ViewId, entries: &[(&str, String)]) -> KinderhubResult<()> {
        {
            let mut stored = self.entries.write().unwrap_or_else(|e| e.into_inner());
            for (key, value) in entries {
                stored.insert((*key).to_string(), value.clone());
            }
        }
        self.emit(origin, entries.iter().map(|(k, _)| (*k).to_string()).collect());
        Ok(())
    }

    fn remove_many(&self, origin: ViewId, keys: &[&str]) -> KinderhubResult<()> {
        let removed = {
            let mut stored = self.entries.write().unwrap_or_else(|e| e.into_inner());
            keys.iter()
                .filter(|key| stored.remove(**key).is_some())
                .count()
        };
        // Removing nothing is not a change
        if removed > 0 {
            self.emit(origin, keys.iter().map(|k| (*k).to_string()).collect());
        }
        Ok(())
    }

    fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        Some(self.changes.subscribe())
    }
}

/// Directory-backed storage, one `<key>.json` file per entry
///
/// Survives process restarts. Has no change feed: other processes observe
/// changes on their next read.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> KinderhubResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            storage_error!(
                format!("Failed to create storage directory {}", dir.display()),
                "file_backend",
                e
            )
        })?;

        info!("Session storage initialized at: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{}.json.tmp", key))
    }

    fn discard(&self, staged: &[(&str, PathBuf)]) {
        for (_, tmp) in staged {
            let _ = std::fs::remove_file(tmp);
        }
    }

    fn io_error(&self, operation: &str, key: &str, error: std::io::Error) -> KinderhubError {
        storage_error!(
            format!("Failed to {} {}: {}", operation, key, error),
            "file_backend",
            error
        )
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> KinderhubResult<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error("read", key, e)),
        }
    }

    fn set_many(&self, _origin: ViewId, entries: &[(&str, String)]) -> KinderhubResult<()> {
        // Stage every entry before replacing any, so a failed write leaves
        // the previous set intact
        let mut staged = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let tmp = self.tmp_path_for(key);
            if let Err(e) = std::fs::write(&tmp, value) {
                self.discard(&staged);
                return Err(self.io_error("write", key, e));
            }
            staged.push((*key, tmp));
        }

        for (key, tmp) in &staged {
            let path = self.path_for(key);
            if let Err(e) = std::fs::rename(tmp, &path) {
                self.discard(&staged);
                return Err(self.io_error("replace", key, e));
            }
            debug!("Saved {} to {}", key, path.display());
        }
        Ok(())
    }

    fn remove_many(&self, _origin: ViewId, keys: &[&str]) -> KinderhubResult<()> {
        for key in keys {
            match std::fs::remove_file(self.path_for(key)) {
                Ok(()) => debug!("Deleted {}", key),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error("remove", key, e)),
            }
        }
        Ok(())
    }
}

/// Backend for contexts without durable storage; every call fails
#[derive(Debug, Default)]
pub struct UnavailableBackend;

impl StorageBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn get(&self, key: &str) -> KinderhubResult<Option<String>> {
        Err(storage_error!(
            format!("Storage unavailable, cannot read {}", key),
            "unavailable_backend"
        ))
    }

    fn set_many(&self, _origin: ViewId, _entries: &[(&str, String)]) -> KinderhubResult<()> {
        Err(storage_error!("Storage unavailable, cannot write", "unavailable_backend"))
    }

    fn remove_many(&self, _origin: ViewId, _keys: &[&str]) -> KinderhubResult<()> {
        Err(storage_error!("Storage unavailable, cannot remove", "unavailable_backend"))
    }
}
