use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const INVITES_PREFIX: &str = "v1/invites/";
pub const SESSIONS_PREFIX: &str = "v1/sessions/";
pub const EVENTS_PREFIX: &str = "v1/events/";
pub const CHAT_SETTINGS_KEY: &str = "v1/chat-settings";
pub const OUTBOX_PREFIX: &str = "v1/outbox/";

pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    /// Full keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    store: Arc<Mutex<BTreeMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.store
            .lock()
            .map_err(|_| Error::Storage("In-memory store poisoned".to_string()))
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One JSON file per key. Keys are stored inside the file next to the value
/// because the file name is a lossy sanitisation of the key.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FileEntry {
    key: String,
    value: String,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let sanitized = key.replace(['/', '\\', ':'], "_");
        self.base_path.join(format!("{}.json", sanitized))
    }

    fn read_entry(&self, path: &PathBuf) -> Result<Option<FileEntry>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read file: {}", e))),
        }
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_entry(&self.key_to_path(key))?
            .filter(|entry| entry.key == key)
            .map(|entry| entry.value))
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string(&FileEntry {
            key: key.to_string(),
            value,
        })?;
        fs::write(&temp_path, content)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| Error::Storage(format!("Failed to replace file: {}", e)))?;
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to read directory: {}", e)))?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?
                .path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match self.read_entry(&path) {
                Ok(Some(entry)) if entry.key.starts_with(prefix) => keys.push(entry.key),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
