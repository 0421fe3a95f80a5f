//! Periodic export of the local document to a [`SnapshotSink`].
//!
//! The timer keeps ticking while switched off and through sink failures; a
//! revoked sink only costs the ticks until access is granted again.

use super::sink::{SinkError, SnapshotSink};
use crate::core::ExportEnvelope;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

/// Builds the export written on every tick.
pub type ExportSource = Arc<dyn Fn() -> ExportEnvelope + Send + Sync>;

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoSnapshotStats {
    pub written: usize,
    pub denied: usize,
    pub failed: usize,
    /// Ticks skipped while switched off.
    pub skipped: usize,
}

#[derive(Default)]
struct Shared {
    enabled: AtomicBool,
    last_snapshot_at: Mutex<Option<String>>,
    written: AtomicUsize,
    denied: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl Shared {
    fn last(&self) -> MutexGuard<'_, Option<String>> {
        match self.last_snapshot_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Serializes `export` and hands it to `sink`.
pub async fn write_export(sink: &dyn SnapshotSink, export: &ExportEnvelope) -> Result<(), SinkError> {
    let bytes = serde_json::to_vec_pretty(export).map_err(|err| SinkError::Io(err.to_string()))?;
    sink.write(&bytes).await
}

/// Owns the interval task. Dropping it stops the task.
pub struct AutoSnapshot {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AutoSnapshot {
    fn default() -> Self {
        let shared = Shared::default();
        shared.enabled.store(true, Ordering::SeqCst);
        Self {
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }
}

impl AutoSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts writing `source()` to `sink` every `every`, replacing a running
    /// task. The first write happens one period from now. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, sink: Arc<dyn SnapshotSink>, every: Duration, source: ExportSource) {
        let every = every.max(MIN_PERIOD);
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !shared.enabled.load(Ordering::SeqCst) {
                    shared.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }

                let export = source();
                match write_export(sink.as_ref(), &export).await {
                    Ok(()) => {
                        shared.written.fetch_add(1, Ordering::SeqCst);
                        debug!(keys = export.data.len(), "automatic snapshot written");
                        *shared.last() = Some(export.exported_at);
                    }
                    Err(SinkError::PermissionDenied(reason)) => {
                        shared.denied.fetch_add(1, Ordering::SeqCst);
                        warn!(%reason, "automatic snapshot skipped, permission denied");
                    }
                    Err(err) => {
                        shared.failed.fetch_add(1, Ordering::SeqCst);
                        warn!(error = %err, "automatic snapshot failed");
                    }
                }
            }
        });

        if let Some(previous) = self.task().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the task. Returns whether one was running.
    pub fn stop(&self) -> bool {
        match self.task().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Toggle; ticks are skipped while off.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// `exportedAt` of the last snapshot written, automatic or manual.
    pub fn last_snapshot_at(&self) -> Option<String> {
        self.shared.last().clone()
    }

    pub(crate) fn record(&self, exported_at: &str) {
        *self.shared.last() = Some(exported_at.to_string());
    }

    pub fn stats(&self) -> AutoSnapshotStats {
        AutoSnapshotStats {
            written: self.shared.written.load(Ordering::SeqCst),
            denied: self.shared.denied.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
            skipped: self.shared.skipped.load(Ordering::SeqCst),
        }
    }
}

impl Drop for AutoSnapshot {
    fn drop(&mut self) {
        self.stop();
    }
}
