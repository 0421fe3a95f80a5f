//! Destinations for exported snapshots.

use crate::core::io_utils::replace_file;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Sink I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// A write capability the user granted once and may revoke.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Writes the whole snapshot to one file, replacing it atomically.
#[derive(Debug)]
pub struct FileSnapshotSink {
    path: PathBuf,
    granted: AtomicBool,
}

impl FileSnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            granted: AtomicBool::new(true),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn revoke(&self) {
        self.granted.store(false, Ordering::SeqCst);
    }

    pub fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSink for FileSnapshotSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if !self.granted.load(Ordering::SeqCst) {
            return Err(SinkError::PermissionDenied(format!(
                "write access to '{}' was revoked",
                self.path.display()
            )));
        }

        replace_file(&self.path, bytes).await?;
        Ok(())
    }
}

/// Collects writes in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    writes: Mutex<Vec<Vec<u8>>>,
    denied: AtomicBool,
}

impl MemorySnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn allow(&self) {
        self.denied.store(false, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        match self.writes.lock() {
            Ok(writes) => writes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl SnapshotSink for MemorySnapshotSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(SinkError::PermissionDenied("memory sink denied".to_string()));
        }
        let mut writes = match self.writes.lock() {
            Ok(writes) => writes,
            Err(poisoned) => poisoned.into_inner(),
        };
        writes.push(bytes.to_vec());
        Ok(())
    }
}
