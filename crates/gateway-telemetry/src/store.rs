//! Injectable atomic state storage.
//!
//! Every piece of shared pipeline state (cursors, fact logs, snapshot
//! history, trigger state, the pipeline lock) is a flat file written through
//! [`StateStore`]. Writes are temp-file-then-rename, so a reader in another
//! process always observes either the fully-old or the fully-new content,
//! never a partial write. Tests substitute [`MemoryStore`].

use crate::error::TelemetryError;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Read/atomic-write interface over named state entries.
pub trait StateStore: Send + Sync {
    /// Loads the entry, or `None` if it has never been written.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, TelemetryError>;

    /// Atomically replaces the entry's contents.
    fn store(&self, name: &str, contents: &[u8]) -> Result<(), TelemetryError>;

    /// Removes the entry; absent entries are not an error.
    fn remove(&self, name: &str) -> Result<(), TelemetryError>;
}

/// Filesystem-backed store rooted at the configured state directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (or creates) the state directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TelemetryError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StateStore for FileStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, TelemetryError> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, name: &str, contents: &[u8]) -> Result<(), TelemetryError> {
        let target = self.path(name);
        let tmp = self.root.join(format!(".{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), TelemetryError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, TelemetryError> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.get(name).cloned())
    }

    fn store(&self, name: &str, contents: &[u8]) -> Result<(), TelemetryError> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), TelemetryError> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.remove(name);
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> TelemetryError {
    TelemetryError::Store(std::io::Error::new(
        std::io::ErrorKind::Other,
        "state store lock poisoned",
    ))
}
