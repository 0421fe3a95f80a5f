//! Filesystem helpers shared by the file-backed tiers.

use super::error::{Result, SyncError};
use std::path::Path;
use tokio::fs;

/// Writes through a temp file next to `path` and renames it into place.
/// Parents must exist; I/O errors come back untouched so callers can tell
/// permission failures apart.
pub async fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

/// [`replace_file`] that creates missing parent directories first.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            SyncError::Io(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    replace_file(path, bytes).await.map_err(|err| {
        SyncError::Io(format!("Failed to replace '{}': {}", path.display(), err))
    })
}
