//! Fast Cache: the synchronous, string-valued local tier.
//!
//! Values are stored as their JSON serialization. Reading never fails from
//! the caller's point of view: a missing, corrupt or `null` entry yields the
//! fallback.

use crate::core::{Document, Result, SyncError, is_reserved_key};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub trait FastCache: Send + Sync {
    fn read_raw(&self, key: &str) -> Option<String>;
    fn write_raw(&self, key: &str, raw: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// Parsed value of `key`, or `None` when it is absent, unparseable or `null`.
pub fn read_value(cache: &dyn FastCache, key: &str) -> Option<Value> {
    let raw = cache.read_raw(key)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(_) => {
            debug!(error = %SyncError::StorageCorrupt(key.to_string()), "fast cache read");
            None
        }
    }
}

pub fn get(cache: &dyn FastCache, key: &str, fallback: Value) -> Value {
    read_value(cache, key).unwrap_or(fallback)
}

/// Serializes and writes `value`. Failures are logged, never returned.
pub fn set(cache: &dyn FastCache, key: &str, value: &Value) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(key, error = %err, "fast cache value not serializable");
            return;
        }
    };
    if let Err(err) = cache.write_raw(key, &raw) {
        warn!(key, error = %err, "fast cache write failed");
    }
}

/// Non-reserved keys, sorted.
pub fn replicated_keys(cache: &dyn FastCache, reserved_prefix: &str) -> Vec<String> {
    let mut keys: Vec<String> = cache
        .keys()
        .into_iter()
        .filter(|key| !is_reserved_key(key, reserved_prefix))
        .collect();
    keys.sort();
    keys
}

/// Whole-document view of the cache, reserved keys excluded. Unreadable
/// entries appear as `null`.
pub fn snapshot(cache: &dyn FastCache, reserved_prefix: &str) -> Document {
    replicated_keys(cache, reserved_prefix)
        .into_iter()
        .map(|key| {
            let value = read_value(cache, &key).unwrap_or(Value::Null);
            (key, value)
        })
        .collect()
}

/// Replaces every non-reserved key with the contents of `data`.
pub fn replace_all(cache: &dyn FastCache, data: &Document, reserved_prefix: &str) {
    for key in replicated_keys(cache, reserved_prefix) {
        if !data.contains_key(&key)
            && let Err(err) = cache.remove(&key)
        {
            warn!(key, error = %err, "fast cache remove failed");
        }
    }
    for (key, value) in data {
        if is_reserved_key(key, reserved_prefix) {
            continue;
        }
        set(cache, key, value);
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// In-memory cache
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryFastCache {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryFastCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FastCache for MemoryFastCache {
    fn read_raw(&self, key: &str) -> Option<String> {
        read_lock(&self.entries).get(key).cloned()
    }

    fn write_raw(&self, key: &str, raw: &str) -> Result<()> {
        write_lock(&self.entries).insert(key.to_string(), raw.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        write_lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        read_lock(&self.entries).keys().cloned().collect()
    }
}

// ============================================================================
// File-backed cache
// ============================================================================

/// A JSON object of raw strings, rewritten atomically on every mutation.
#[derive(Debug)]
pub struct FileFastCache {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileFastCache {
    /// Opens the cache at `path`. A missing file starts empty; a corrupt one
    /// is logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "fast cache file is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let body = serde_json::to_vec(entries)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut temp = NamedTempFile::new_in(&parent)?;
        temp.write_all(&body)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|err| SyncError::Io(err.error.to_string()))?;
        Ok(())
    }
}

impl FastCache for FileFastCache {
    fn read_raw(&self, key: &str) -> Option<String> {
        read_lock(&self.entries).get(key).cloned()
    }

    fn write_raw(&self, key: &str, raw: &str) -> Result<()> {
        let mut entries = write_lock(&self.entries);
        entries.insert(key.to_string(), raw.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = write_lock(&self.entries);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        read_lock(&self.entries).keys().cloned().collect()
    }
}
