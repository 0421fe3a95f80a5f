//! Canonical state held by the server.
//!
//! All mutations (save, restore, upload) run under one mutex, so the
//! read-previous / classify / backup / write sequence is atomic with respect
//! to other requests.

use super::backups::{BackupListing, BackupManager, BackupSource};
use super::delta::{DeltaReport, DeltaThresholds, measure_delta};
use super::naming::{PRE_RESTORE_HINT, sanitize_hint};
use crate::config::ServerConfig;
use crate::core::io_utils::atomic_write;
use crate::core::{Document, Envelope, Result, SyncError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info, info_span, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// Name of the backup taken of the previous document, if the write was a
    /// great delta.
    pub backup: Option<String>,
    pub delta: DeltaReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub restored: String,
    pub source: BackupSource,
    /// Backup of the state that was current before the restore.
    pub pre_restore_backup: Option<String>,
}

#[derive(Debug)]
pub struct StateStore {
    state_file: PathBuf,
    backups: BackupManager,
    thresholds: DeltaThresholds,
    meta_key: Option<String>,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        fs::create_dir_all(config.data_dir()).await?;
        let backups = BackupManager::new(
            config.primary_backup_dir(),
            config.secondary_backup_dir(),
            config.max_backups,
        );
        backups.ensure_dirs().await?;

        Ok(Self {
            state_file: config.state_file(),
            backups,
            thresholds: config.thresholds(),
            meta_key: Some(config.meta_key.clone()).filter(|key| !key.is_empty()),
            write_lock: Mutex::new(()),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Current canonical document; missing or corrupt state reads as empty.
    pub async fn load_data(&self) -> Result<Document> {
        Ok(self
            .load_raw()
            .await?
            .as_ref()
            .and_then(Envelope::decode_data)
            .unwrap_or_default())
    }

    async fn load_raw(&self) -> Result<Option<Value>> {
        let bytes = match fs::read(&self.state_file).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(
                    path = %self.state_file.display(),
                    error = %err,
                    "canonical state is corrupt, treating as empty"
                );
                Ok(None)
            }
        }
    }

    async fn write_canonical(&self, data: Document) -> Result<()> {
        let envelope = Envelope::new(data);
        atomic_write(&self.state_file, &envelope.to_pretty_bytes()?).await
    }

    /// Replaces canonical state, first backing up the previous envelope when
    /// the change is a great delta.
    pub async fn save(&self, next: Document) -> Result<SaveOutcome> {
        let span = info_span!("state.save", keys = next.len());
        self.save_locked(next).instrument(span).await
    }

    async fn save_locked(&self, next: Document) -> Result<SaveOutcome> {
        let _guard = self.write_lock.lock().await;

        let previous_raw = self.load_raw().await?;
        let previous = previous_raw
            .as_ref()
            .and_then(Envelope::decode_data)
            .unwrap_or_default();

        let delta = measure_delta(&previous, &next, self.meta_key.as_deref());
        let mut backup = None;
        if delta.is_great(&self.thresholds) {
            let envelope = match previous_raw {
                Some(raw @ Value::Object(_)) => raw,
                _ => Envelope::new(previous).to_value(),
            };
            match self.backups.write_backup(&envelope, None).await {
                Ok(name) => {
                    event!(
                        Level::INFO,
                        backup = %name,
                        size_ratio = delta.size_ratio,
                        key_ratio = delta.key_ratio,
                        "great delta, previous state backed up"
                    );
                    backup = Some(name);
                }
                Err(err) => {
                    warn!(error = %err, "backup before state write failed, continuing");
                }
            }
        }

        let keys = next.len();
        self.write_canonical(next).await?;
        event!(Level::DEBUG, keys, "canonical state written");

        Ok(SaveOutcome { backup, delta })
    }

    /// Makes the named backup canonical. The state being replaced is backed
    /// up first so the restore can itself be undone.
    pub async fn restore(&self, name: &str, source: BackupSource) -> Result<RestoreOutcome> {
        let span = info_span!("state.restore", backup = %name, source = source.as_str());
        self.restore_locked(name, source).instrument(span).await
    }

    async fn restore_locked(&self, name: &str, source: BackupSource) -> Result<RestoreOutcome> {
        let backup = self.backups.read(name, source).await?;
        let data = Envelope::decode_data(&backup)
            .ok_or_else(|| SyncError::RestoreOfMissingBackup(name.to_string()))?;

        let _guard = self.write_lock.lock().await;

        let pre_restore_backup = match self.load_raw().await? {
            Some(current @ Value::Object(_)) => Some(
                self.backups
                    .write_backup(&current, Some(PRE_RESTORE_HINT))
                    .await?,
            ),
            _ => None,
        };

        self.write_canonical(data).await?;
        info!(backup = %name, source = source.as_str(), "state restored from backup");

        Ok(RestoreOutcome {
            restored: name.to_string(),
            source,
            pre_restore_backup,
        })
    }

    /// Stores an externally supplied envelope as a backup entry. Canonical
    /// state is untouched.
    pub async fn upload(&self, hint: Option<&str>, backup: &Value) -> Result<String> {
        let envelope = Envelope::restamp(backup).ok_or_else(|| {
            SyncError::InvalidPayload(
                "backup must be a JSON object whose 'data' is an object".to_string(),
            )
        })?;
        let hint = sanitize_hint(hint);

        let _guard = self.write_lock.lock().await;
        let name = self
            .backups
            .write_backup(&envelope.to_value(), Some(&hint))
            .await?;
        info!(backup = %name, "backup uploaded");
        Ok(name)
    }

    pub async fn list_backups(&self) -> Result<BackupListing> {
        self.backups.list_all().await
    }
}
