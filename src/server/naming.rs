//! Backup file names.
//!
//! `server_state_<YYYYMMDD>_<HHMMSS>.<mmm>_<NNN>[_<hint>].json`
//!
//! The millisecond stamp plus the `<NNN>` sequence make lexicographic order of
//! names equal to chronological order of writes within one server process.

use crate::core::{Result, SyncError};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Mutex;

pub const BACKUP_PREFIX: &str = "server_state_";
pub const DEFAULT_UPLOAD_HINT: &str = "uploaded";
pub const PRE_RESTORE_HINT: &str = "pre-restore";
pub const MAX_HINT_LEN: usize = 40;

lazy_static! {
    static ref BACKUP_FILE_PATTERN: Regex = Regex::new(
        r"^server_state_[0-9]{8}_[0-9]{6}\.[0-9]{3}_[0-9]{3}(?:_[a-zA-Z0-9._-]+)?\.json$"
    )
    .expect("backup file pattern must compile");
}

pub fn is_backup_file_name(name: &str) -> bool {
    BACKUP_FILE_PATTERN.is_match(name)
}

/// Checks a client-supplied name before any filesystem access.
pub fn validate_backup_name(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') || name.contains('\0') || name.starts_with("..") {
        return Err(SyncError::PathTraversalAttempt(name.to_string()));
    }
    if !is_backup_file_name(name) {
        return Err(SyncError::InvalidBackupName(name.to_string()));
    }
    Ok(())
}

/// Maps an arbitrary label onto the hint alphabet.
pub fn sanitize_hint(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or(DEFAULT_UPLOAD_HINT)
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_HINT_LEN)
        .collect();

    if cleaned.is_empty() {
        DEFAULT_UPLOAD_HINT.to_string()
    } else {
        cleaned
    }
}

/// Produces strictly increasing backup names.
#[derive(Debug)]
pub struct BackupNamer {
    // (last stamp in unix ms, sequence used for it)
    last: Mutex<(i64, u32)>,
}

impl Default for BackupNamer {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupNamer {
    pub fn new() -> Self {
        Self {
            last: Mutex::new((i64::MIN, 0)),
        }
    }

    pub fn next_name(&self, hint: Option<&str>) -> String {
        self.next_name_at(Utc::now(), hint)
    }

    pub fn next_name_at(&self, now: DateTime<Utc>, hint: Option<&str>) -> String {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (last_ms, last_seq) = *last;
        let mut stamp_ms = now.timestamp_millis();
        let mut seq = 0;
        if stamp_ms <= last_ms {
            stamp_ms = last_ms;
            seq = last_seq + 1;
            if seq > 999 {
                stamp_ms += 1;
                seq = 0;
            }
        }
        *last = (stamp_ms, seq);

        let at = DateTime::<Utc>::from_timestamp_millis(stamp_ms).unwrap_or(now);
        let suffix = hint
            .map(|hint| format!("_{}", sanitize_hint(Some(hint))))
            .unwrap_or_default();

        format!(
            "{}{}_{:03}{}.json",
            BACKUP_PREFIX,
            at.format("%Y%m%d_%H%M%S%.3f"),
            seq,
            suffix
        )
    }
}
