//! Key-value storage substrates for the credential store.
//!
//! All implementations are synchronous so the gate and the request pipeline
//! can consult them on every call without awaiting I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store, used by tests and short-lived CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object in the cache directory.
///
/// The whole file is rewritten on every mutation, which keeps the on-disk
/// state a complete snapshot at all times.
pub struct FileStore {
    cache_dir: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: RwLock::new(()),
        }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&path)
            .context("Failed to read session file")?;
        let entries = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(entries)
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> Result<()> {
        let path = self.session_path();
        if entries.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove session file")?;
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&path, contents).context("Failed to write session file")?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow::anyhow!("File store lock poisoned"))?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("File store lock poisoned"))?;
        // A corrupt file is replaced rather than blocking new logins
        let mut entries = self.read_all().unwrap_or_default();
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("File store lock poisoned"))?;
        let mut entries = self.read_all().unwrap_or_default();
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}
