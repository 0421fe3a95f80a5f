//! The collaborator-facing engine: every domain view reads and writes through
//! [`SyncEngine`].

use super::auto_snapshot::{AutoSnapshot, ExportSource, write_export};
use super::durable::{DurableMirror, DurableStore, FileDurableStore, MemoryDurableStore};
use super::fast_cache::{self, FastCache, FileFastCache, MemoryFastCache};
use super::reconcile::ReconcileReport;
use super::remote::{HttpRemoteStore, RemoteStore};
use super::scheduler::PushScheduler;
use super::sink::{SinkError, SnapshotSink};
use crate::config::EngineConfig;
use crate::core::{
    Document, ENVELOPE_VERSION, ExportEnvelope, MetaRecord, Result, SyncError, is_reserved_key,
    now_timestamp,
};
use crate::server::{BackupListing, BackupSource};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, info, warn};

pub const FAST_CACHE_FILE: &str = "fast_cache.json";
pub const DURABLE_STORE_FILE: &str = "durable.msgpack";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Remote,
    Import,
    Reset,
}

/// Notification sent to subscribers after a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Set { key: String },
    Removed { key: String },
    /// The whole document was replaced.
    Replaced { origin: ChangeOrigin },
}

/// Bounds `fut` by `timeout`, mapping expiry to `RemoteTimeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::RemoteTimeout(timeout.as_millis() as u64)),
    }
}

pub struct SyncEngine {
    pub(crate) config: EngineConfig,
    pub(crate) cache: Arc<dyn FastCache>,
    pub(crate) durable: Arc<dyn DurableStore>,
    pub(crate) mirror: DurableMirror,
    pub(crate) durable_available: AtomicBool,
    pub(crate) remote: Option<Arc<dyn RemoteStore>>,
    pub(crate) scheduler: PushScheduler,
    pub(crate) ready: AtomicBool,
    pub(crate) report: OnceCell<ReconcileReport>,
    auto_snapshot: AutoSnapshot,
    events: broadcast::Sender<ChangeEvent>,
}

/// Export of the fast cache as it is right now.
fn build_export(cache: &dyn FastCache, config: &EngineConfig) -> ExportEnvelope {
    let meta = fast_cache::read_value(cache, &config.meta_key)
        .and_then(|value| serde_json::from_value::<MetaRecord>(value).ok());
    ExportEnvelope {
        version: ENVELOPE_VERSION,
        app_version: meta
            .as_ref()
            .map(|meta| meta.version.clone())
            .unwrap_or_else(|| config.app_version.clone()),
        last_saved_at: meta.map(|meta| meta.last_saved_at),
        exported_at: now_timestamp(),
        data: fast_cache::snapshot(cache, &config.reserved_prefix),
    }
}

impl SyncEngine {
    /// Wires the three tiers together. Spawns the durable mirror worker, so it
    /// must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        cache: Arc<dyn FastCache>,
        durable: Arc<dyn DurableStore>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scheduler: PushScheduler::new(config.debounce),
            mirror: DurableMirror::spawn(durable.clone()),
            config,
            cache,
            durable,
            durable_available: AtomicBool::new(true),
            remote,
            ready: AtomicBool::new(false),
            report: OnceCell::new(),
            auto_snapshot: AutoSnapshot::new(),
            events,
        }
    }

    /// Offline engine over in-memory tiers.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryFastCache::new()),
            Arc::new(MemoryDurableStore::new()),
            None,
        )
    }

    /// File-backed local tiers under `dir`, plus an HTTP remote when
    /// `config.remote_url` is set.
    pub fn open(config: EngineConfig, dir: &Path) -> Result<Self> {
        let cache = FileFastCache::open(dir.join(FAST_CACHE_FILE))?;
        let durable = FileDurableStore::new(dir.join(DURABLE_STORE_FILE));
        let remote = HttpRemoteStore::from_config(&config)?
            .map(|remote| Arc::new(remote) as Arc<dyn RemoteStore>);
        Ok(Self::new(config, Arc::new(cache), Arc::new(durable), remote))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &PushScheduler {
        &self.scheduler
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_durable_available(&self) -> bool {
        self.durable_available.load(Ordering::SeqCst)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_reserved(&self, key: &str) -> bool {
        is_reserved_key(key, &self.config.reserved_prefix)
    }

    fn mirror_enabled(&self) -> bool {
        self.is_ready() && self.is_durable_available()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &str, fallback: Value) -> Value {
        fast_cache::get(self.cache.as_ref(), key, fallback)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        fast_cache::read_value(self.cache.as_ref(), key)
    }

    /// Typed read; `None` when missing, corrupt or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_value(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn meta(&self) -> Option<MetaRecord> {
        self.get_as(&self.config.meta_key)
    }

    /// The replicated document as the Fast Cache currently holds it.
    pub fn snapshot(&self) -> Document {
        fast_cache::snapshot(self.cache.as_ref(), &self.config.reserved_prefix)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Writes `value` under `key`. Never fails; tier errors are logged.
    pub fn set(&self, key: &str, value: Value) {
        fast_cache::set(self.cache.as_ref(), key, &value);
        if self.is_reserved(key) {
            return;
        }

        if self.mirror_enabled() {
            self.mirror.put(key, &value);
        }
        if key != self.config.meta_key {
            self.touch_meta();
        }
        self.schedule_push();
        self.emit(ChangeEvent::Set {
            key: key.to_string(),
        });
    }

    pub fn remove(&self, key: &str) {
        if let Err(err) = self.cache.remove(key) {
            warn!(key, error = %err, "fast cache remove failed");
        }
        if self.is_reserved(key) {
            return;
        }

        if self.mirror_enabled() {
            self.mirror.delete(key);
        }
        if key != self.config.meta_key {
            self.touch_meta();
        }
        self.schedule_push();
        self.emit(ChangeEvent::Removed {
            key: key.to_string(),
        });
    }

    fn touch_meta(&self) {
        let meta = match serde_json::to_value(MetaRecord::now(&self.config.app_version)) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, "metadata record not serializable");
                return;
            }
        };
        fast_cache::set(self.cache.as_ref(), &self.config.meta_key, &meta);
        if self.mirror_enabled() {
            self.mirror.put(&self.config.meta_key, &meta);
        }
    }

    /// Removes every non-reserved key from both local tiers. Once ready, the
    /// empty document is pushed like any other change.
    pub fn reset(&self) {
        {
            let _quiet = self.scheduler.suppress();
            self.clear_local();
        }
        self.schedule_push();
        self.emit(ChangeEvent::Replaced {
            origin: ChangeOrigin::Reset,
        });
    }

    pub(crate) fn clear_local(&self) {
        for key in fast_cache::replicated_keys(self.cache.as_ref(), &self.config.reserved_prefix) {
            if let Err(err) = self.cache.remove(&key) {
                warn!(key, error = %err, "fast cache remove failed");
            }
        }
        if self.is_durable_available() {
            self.mirror.clear();
        }
    }

    /// Replaces the whole local document with `data`, without echoing it
    /// back to the remote.
    pub(crate) fn apply_document(&self, data: &Document, origin: ChangeOrigin) {
        let _quiet = self.scheduler.suppress();
        fast_cache::replace_all(self.cache.as_ref(), data, &self.config.reserved_prefix);
        if self.is_durable_available() {
            let replicated: Document = data
                .iter()
                .filter(|(key, _)| !self.is_reserved(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            self.mirror.replace_all(replicated);
        }
        self.emit(ChangeEvent::Replaced { origin });
    }

    /// Waits until every queued durable write has been applied.
    pub async fn flush(&self) {
        self.mirror.flush().await;
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn export_snapshot(&self) -> ExportEnvelope {
        build_export(self.cache.as_ref(), &self.config)
    }

    /// Applies an exported snapshot (`{data: {...}}`). Returns `false`, and
    /// changes nothing, when the payload has no `data` object.
    pub fn import_snapshot(&self, snapshot: &Value) -> bool {
        let Some(Value::Object(data)) = snapshot.get("data") else {
            debug!("import ignored, snapshot has no data object");
            return false;
        };

        self.apply_document(data, ChangeOrigin::Import);
        self.touch_meta();
        self.schedule_push();
        info!(keys = data.len(), "snapshot imported");
        true
    }

    pub async fn write_snapshot_to(&self, sink: &dyn SnapshotSink) -> std::result::Result<(), SinkError> {
        let export = self.export_snapshot();
        write_export(sink, &export).await?;
        self.auto_snapshot.record(&export.exported_at);
        Ok(())
    }

    /// Writes an export to `sink` every `config.snapshot_interval` until
    /// stopped or the engine is dropped. Replaces a running schedule.
    pub fn start_auto_snapshot(&self, sink: Arc<dyn SnapshotSink>) {
        let cache = self.cache.clone();
        let config = self.config.clone();
        let source: ExportSource = Arc::new(move || build_export(cache.as_ref(), &config));
        self.auto_snapshot
            .start(sink, self.config.snapshot_interval, source);
        info!(
            every_secs = self.config.snapshot_interval.as_secs(),
            "automatic local snapshots scheduled"
        );
    }

    pub fn stop_auto_snapshot(&self) -> bool {
        self.auto_snapshot.stop()
    }

    /// Pauses or resumes automatic snapshots without dropping the schedule.
    pub fn set_auto_snapshot_enabled(&self, enabled: bool) {
        self.auto_snapshot.set_enabled(enabled);
    }

    pub fn auto_snapshot(&self) -> &AutoSnapshot {
        &self.auto_snapshot
    }

    /// `exportedAt` of the last snapshot written to any sink.
    pub fn last_snapshot_at(&self) -> Option<String> {
        self.auto_snapshot.last_snapshot_at()
    }

    // ========================================================================
    // Remote
    // ========================================================================

    fn remote(&self) -> Result<&Arc<dyn RemoteStore>> {
        self.remote
            .as_ref()
            .ok_or_else(|| SyncError::RemoteUnreachable("no remote configured".to_string()))
    }

    fn push_job(&self) -> Option<impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static> {
        let remote = self.remote.clone()?;
        let cache = self.cache.clone();
        let prefix = self.config.reserved_prefix.clone();
        let timeout = self.config.remote_timeout;

        Some(move || {
            async move {
                // built when the timer fires, so the latest state goes out
                let data = fast_cache::snapshot(cache.as_ref(), &prefix);
                with_timeout(timeout, remote.push(&data)).await?;
                debug!(keys = data.len(), "state pushed");
                Ok(())
            }
            .boxed()
        })
    }

    /// Arms the debounced push. No-op before reconciliation completes and in
    /// offline contexts.
    pub fn schedule_push(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        match self.push_job() {
            Some(job) => self.scheduler.schedule(job),
            None => false,
        }
    }

    /// Pushes now, bypassing the quiet window. `Ok(false)` when offline or
    /// when another push is in flight.
    pub async fn push_now(&self) -> Result<bool> {
        match self.push_job() {
            Some(job) => self.scheduler.run_now(job).await,
            None => Ok(false),
        }
    }

    /// Pulls the remote document and, when non-empty, makes it the local one.
    pub async fn pull_now(&self) -> Result<bool> {
        let remote = self.remote()?;
        let data = with_timeout(self.config.remote_timeout, remote.pull()).await?;
        if data.is_empty() {
            return Ok(false);
        }
        self.apply_document(&data, ChangeOrigin::Remote);
        Ok(true)
    }

    pub async fn list_remote_backups(&self) -> Result<BackupListing> {
        let remote = self.remote()?;
        with_timeout(self.config.remote_timeout, remote.list_backups()).await
    }

    /// Restores a server-side backup and adopts the restored document locally.
    pub async fn restore_remote_backup(&self, name: &str, source: BackupSource) -> Result<()> {
        let remote = self.remote()?;
        with_timeout(self.config.remote_timeout, remote.restore_backup(name, source)).await?;
        let data = with_timeout(self.config.remote_timeout, remote.pull()).await?;
        self.apply_document(&data, ChangeOrigin::Remote);
        info!(backup = name, source = source.as_str(), "remote backup restored");
        Ok(())
    }

    /// Uploads the current export as a server-side backup entry.
    pub async fn upload_snapshot_backup(&self, hint: Option<&str>) -> Result<String> {
        let remote = self.remote()?;
        let snapshot = self.export_snapshot().to_value();
        with_timeout(self.config.remote_timeout, remote.upload_backup(hint, &snapshot)).await
    }
}
