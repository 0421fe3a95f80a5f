//! Durable Store: the asynchronous local key/value tier, and the mirror
//! worker that applies Fast Cache writes to it in order.

use crate::core::io_utils::atomic_write;
use crate::core::{Document, Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Prepares the store. Idempotent; the first call creates whatever
    /// backing layout is missing.
    async fn open(&self) -> Result<()>;
    async fn get_all(&self) -> Result<Document>;
    async fn put(&self, key: &str, value: &Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    entries: RwLock<Document>,
    failing: AtomicBool,
    opens: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Document) -> Self {
        Self {
            entries: RwLock::new(entries),
            ..Self::default()
        }
    }

    /// While set, every operation fails with `DurableStoreUnavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Document {
        self.entries.read().await.clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::DurableStoreUnavailable(
                "memory store switched to failing".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn open(&self) -> Result<()> {
        self.check()?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_all(&self) -> Result<Document> {
        self.check()?;
        Ok(self.entries.read().await.clone())
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.check()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.entries.write().await.clear();
        Ok(())
    }
}

// ============================================================================
// MessagePack file store
// ============================================================================

/// Whole map kept in memory and rewritten as one MessagePack file per
/// mutation.
#[derive(Debug)]
pub struct FileDurableStore {
    path: PathBuf,
    entries: Mutex<Option<Document>>,
}

impl FileDurableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Document> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(err) => {
                return Err(SyncError::DurableStoreUnavailable(format!(
                    "Failed to read '{}': {}",
                    self.path.display(),
                    err
                )));
            }
        };

        match rmp_serde::from_slice::<Document>(&bytes) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "durable store file is corrupt, starting empty"
                );
                Ok(Document::new())
            }
        }
    }

    async fn persist(&self, entries: &Document) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(entries).map_err(|e| {
            SyncError::Serialization(format!("Failed to serialize durable store: {}", e))
        })?;
        atomic_write(&self.path, &bytes).await
    }

    async fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Document) + Send,
    {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or_else(|| {
            SyncError::DurableStoreUnavailable("durable store used before open".to_string())
        })?;
        apply(entries);
        self.persist(entries).await
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let entries = self.load().await?;
        if !self.path.exists() {
            self.persist(&entries).await?;
        }
        *guard = Some(entries);
        Ok(())
    }

    async fn get_all(&self) -> Result<Document> {
        self.entries.lock().await.clone().ok_or_else(|| {
            SyncError::DurableStoreUnavailable("durable store used before open".to_string())
        })
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        let key = key.to_string();
        let value = value.clone();
        self.mutate(move |entries| {
            entries.insert(key, value);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate(move |entries| {
            entries.remove(&key);
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.mutate(|entries| entries.clear()).await
    }
}

// ============================================================================
// Mirror worker
// ============================================================================

enum MirrorOp {
    Put(String, Value),
    Delete(String),
    Clear,
    ReplaceAll(Document),
    Flush(oneshot::Sender<()>),
}

/// Applies queued mutations to a [`DurableStore`] on a background task, in
/// the order they were queued. Enqueueing never blocks and never fails.
pub struct DurableMirror {
    tx: Option<mpsc::UnboundedSender<MirrorOp>>,
    join_handle: Option<JoinHandle<()>>,
}

impl DurableMirror {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MirrorOp>();

        let join_handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let outcome = match op {
                    MirrorOp::Put(key, value) => store.put(&key, &value).await,
                    MirrorOp::Delete(key) => store.delete(&key).await,
                    MirrorOp::Clear => store.clear().await,
                    MirrorOp::ReplaceAll(data) => replace_all(store.as_ref(), &data).await,
                    MirrorOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(err) = outcome {
                    warn!(error = %err, "durable mirror write failed");
                }
            }
            debug!("durable mirror worker stopped");
        });

        Self {
            tx: Some(tx),
            join_handle: Some(join_handle),
        }
    }

    fn send(&self, op: MirrorOp) {
        if let Some(tx) = &self.tx
            && tx.send(op).is_err()
        {
            warn!("durable mirror worker is gone, write dropped");
        }
    }

    pub fn put(&self, key: &str, value: &Value) {
        self.send(MirrorOp::Put(key.to_string(), value.clone()));
    }

    pub fn delete(&self, key: &str) {
        self.send(MirrorOp::Delete(key.to_string()));
    }

    pub fn clear(&self) {
        self.send(MirrorOp::Clear);
    }

    /// Clears the store and writes `data` in its place.
    pub fn replace_all(&self, data: Document) {
        self.send(MirrorOp::ReplaceAll(data));
    }

    /// Resolves once every mutation queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MirrorOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    /// Drains the queue and waits for the worker to exit.
    pub async fn stop(mut self) {
        self.tx.take();
        if let Some(join_handle) = self.join_handle.take()
            && let Err(err) = join_handle.await
        {
            warn!(error = %err, "durable mirror worker join failed");
        }
    }
}

async fn replace_all(store: &dyn DurableStore, data: &Document) -> Result<()> {
    store.clear().await?;
    for (key, value) in data {
        store.put(key, value).await?;
    }
    Ok(())
}
