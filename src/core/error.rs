use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Stored value for '{0}' is not valid JSON")]
    StorageCorrupt(String),

    #[error("Durable store unavailable: {0}")]
    DurableStoreUnavailable(String),

    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Remote rejected request with status {status}")]
    RemoteRejected { status: u16 },

    #[error("Remote request timed out after {0} ms")]
    RemoteTimeout(u64),

    #[error("Invalid backup name: {0}")]
    InvalidBackupName(String),

    #[error("Backup name '{0}' attempts to escape the backup directory")]
    PathTraversalAttempt(String),

    #[error("Payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Backup '{0}' does not exist or is unreadable")]
    RestoreOfMissingBackup(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// True for failures that leave the caller on local tiers until the next
    /// push cycle.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnreachable(_) | Self::RemoteRejected { .. } | Self::RemoteTimeout(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Io(format!("lock poisoned: {err}"))
    }
}
