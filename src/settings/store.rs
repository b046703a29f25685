//! Persistence store collaborators
//!
//! A store is a flat label -> bytes map. The cluster owns exactly one and
//! opens/erases records through it; what sits behind (a directory, a
//! registry, a table in an ops database) is the embedder's choice.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{SettingsError, SettingsResult};

/// Backing store for authoritative settings records.
pub trait PersistenceStore: Send + Sync {
    /// Write (or overwrite) the record for a label.
    fn put(&self, label: &str, bytes: &[u8]) -> SettingsResult<()>;

    /// Read the record for a label, if present.
    fn get(&self, label: &str) -> SettingsResult<Option<Vec<u8>>>;

    /// Remove the record for a label. Removing an absent record is a no-op.
    fn remove(&self, label: &str) -> SettingsResult<()>;
}

/// In-memory store, for tests and ephemeral clusters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceStore for MemoryStore {
    fn put(&self, label: &str, bytes: &[u8]) -> SettingsResult<()> {
        self.lock().insert(label.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, label: &str) -> SettingsResult<Option<Vec<u8>>> {
        Ok(self.lock().get(label).cloned())
    }

    fn remove(&self, label: &str) -> SettingsResult<()> {
        self.lock().remove(label);
        Ok(())
    }
}

/// File-backed store: one file per label under a root directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> SettingsResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| SettingsError::store(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn record_path(&self, label: &str) -> PathBuf {
        // Labels may contain path-hostile characters; keep only a safe
        // subset and disambiguate nothing further (labels are caller-chosen
        // and expected to be short identifiers).
        let safe: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.cluster.json"))
    }
}

impl PersistenceStore for FileStore {
    fn put(&self, label: &str, bytes: &[u8]) -> SettingsResult<()> {
        let path = self.record_path(label);
        fs::write(&path, bytes)
            .map_err(|e| SettingsError::store(format!("write {}: {e}", path.display())))
    }

    fn get(&self, label: &str) -> SettingsResult<Option<Vec<u8>>> {
        let path = self.record_path(label);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SettingsError::store(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    fn remove(&self, label: &str) -> SettingsResult<()> {
        let path = self.record_path(label);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SettingsError::store(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}
