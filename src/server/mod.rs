//! State server: canonical document, great-delta backups and the HTTP API.

pub mod backups;
pub mod delta;
pub mod naming;
pub mod state_store;
pub mod web;

pub use backups::{BackupEntry, BackupListing, BackupManager, BackupSource};
pub use delta::{DeltaReport, DeltaThresholds, is_great_delta, measure_delta};
pub use naming::{BackupNamer, sanitize_hint, validate_backup_name};
pub use state_store::{RestoreOutcome, SaveOutcome, StateStore};
pub use web::{ApiError, AppState, build_router};
