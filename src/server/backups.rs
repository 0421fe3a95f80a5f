//! Backup Retention Manager.
//!
//! Every backup is written to two independent directories under the same
//! name, and each directory is pruned on its own to the most recent
//! `max_backups` names. Files are never rewritten once they exist.

use super::naming::{BackupNamer, is_backup_file_name, validate_backup_name};
use crate::core::io_utils::atomic_write;
use crate::core::{Result, SyncError, format_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupSource {
    Primary,
    Secondary,
}

impl BackupSource {
    /// Missing source means primary; anything but the two known names is rejected.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            None | Some("primary") => Some(Self::Primary),
            Some("secondary") => Some(Self::Secondary),
            Some(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub source: BackupSource,
    pub size: u64,
    pub modified_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupListing {
    pub primary: Vec<BackupEntry>,
    pub secondary: Vec<BackupEntry>,
}

#[derive(Debug)]
pub struct BackupManager {
    primary_dir: PathBuf,
    secondary_dir: PathBuf,
    max_backups: usize,
    namer: BackupNamer,
}

impl BackupManager {
    pub fn new(
        primary_dir: impl Into<PathBuf>,
        secondary_dir: impl Into<PathBuf>,
        max_backups: usize,
    ) -> Self {
        Self {
            primary_dir: primary_dir.into(),
            secondary_dir: secondary_dir.into(),
            max_backups: max_backups.max(1),
            namer: BackupNamer::new(),
        }
    }

    pub fn dir_for(&self, source: BackupSource) -> &Path {
        match source {
            BackupSource::Primary => &self.primary_dir,
            BackupSource::Secondary => &self.secondary_dir,
        }
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.primary_dir).await?;
        fs::create_dir_all(&self.secondary_dir).await?;
        Ok(())
    }

    /// Writes `envelope` under a fresh name to both directories, then prunes.
    pub async fn write_backup(&self, envelope: &Value, hint: Option<&str>) -> Result<String> {
        let body = serde_json::to_vec_pretty(envelope)?;
        let name = self.namer.next_name(hint);

        for dir in [&self.primary_dir, &self.secondary_dir] {
            atomic_write(&dir.join(&name), &body).await?;
        }
        debug!(backup = %name, bytes = body.len(), "backup written");

        self.prune().await?;
        Ok(name)
    }

    /// Prunes both directories; returns how many files were removed.
    pub async fn prune(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in [&self.primary_dir, &self.secondary_dir] {
            removed += self.prune_dir(dir).await?;
        }
        Ok(removed)
    }

    async fn prune_dir(&self, dir: &Path) -> Result<usize> {
        let names = list_backup_names(dir).await?;
        let excess = names.len().saturating_sub(self.max_backups);
        let mut removed = 0;
        for name in names.iter().take(excess) {
            match fs::remove_file(dir.join(name)).await {
                Ok(()) => removed += 1,
                // a failed prune must not block the state write that triggered it
                Err(err) => warn!(backup = %name, dir = %dir.display(), error = %err, "backup prune failed"),
            }
        }
        Ok(removed)
    }

    /// Entries of one directory, newest first.
    pub async fn list(&self, source: BackupSource) -> Result<Vec<BackupEntry>> {
        let dir = self.dir_for(source);
        let mut names = list_backup_names(dir).await?;
        names.reverse();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let metadata = match fs::metadata(dir.join(&name)).await {
                Ok(metadata) => metadata,
                // pruned between read_dir and stat
                Err(_) => continue,
            };
            let modified_at = metadata
                .modified()
                .map(|at| format_timestamp(DateTime::<Utc>::from(at)))
                .unwrap_or_default();
            entries.push(BackupEntry {
                name,
                source,
                size: metadata.len(),
                modified_at,
            });
        }
        Ok(entries)
    }

    pub async fn list_all(&self) -> Result<BackupListing> {
        Ok(BackupListing {
            primary: self.list(BackupSource::Primary).await?,
            secondary: self.list(BackupSource::Secondary).await?,
        })
    }

    /// Reads a backup envelope. The name is validated before the filesystem
    /// is touched.
    pub async fn read(&self, name: &str, source: BackupSource) -> Result<Value> {
        validate_backup_name(name)?;

        let path = self.dir_for(source).join(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::RestoreOfMissingBackup(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice::<Value>(&bytes)
            .map_err(|_| SyncError::RestoreOfMissingBackup(name.to_string()))
    }
}

/// Backup names in `dir`, oldest first. A missing directory has no backups.
pub async fn list_backup_names(dir: &Path) -> Result<Vec<String>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if let Some(name) = entry.file_name().to_str()
            && is_backup_file_name(name)
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
