use crate::core::{DEFAULT_META_KEY, DEFAULT_RESERVED_PREFIX};
use crate::server::delta::DeltaThresholds;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_BACKUPS: usize = 10;
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_DEBOUNCE_MS: u64 = 350;
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60 * 60;
pub const STATE_FILE_NAME: &str = "server_state.json";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        _ => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

// ============================================================================
// Server configuration
// ============================================================================

/// Configuration of the state server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Root of the canonical state file and both backup directories.
    pub data_dir: PathBuf,

    /// Retained backups per directory.
    pub max_backups: usize,

    pub delta_size_ratio: f64,
    pub delta_key_ratio: f64,

    /// Document key excluded from delta classification.
    pub meta_key: String,

    /// When set, every `/api/*` request must present this bearer token.
    pub bearer_token: Option<String>,

    /// Static files served for anything that is not an API route.
    pub public_dir: Option<PathBuf>,

    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: data_dir.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
            delta_size_ratio: DeltaThresholds::default().size_ratio,
            delta_key_ratio: DeltaThresholds::default().key_ratio,
            meta_key: DEFAULT_META_KEY.to_string(),
            bearer_token: None,
            public_dir: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Loads configuration from `DASHSTATE_*` variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::new("user_data");
        let config = Self {
            host: env_opt("DASHSTATE_HOST").unwrap_or(defaults.host),
            port: env_or("DASHSTATE_PORT", defaults.port)?,
            data_dir: env_opt("DASHSTATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_backups: env_or("DASHSTATE_MAX_BACKUPS", defaults.max_backups)?,
            delta_size_ratio: env_or("DASHSTATE_DELTA_SIZE_RATIO", defaults.delta_size_ratio)?,
            delta_key_ratio: env_or("DASHSTATE_DELTA_KEY_RATIO", defaults.delta_key_ratio)?,
            meta_key: env_opt("DASHSTATE_META_KEY").unwrap_or(defaults.meta_key),
            bearer_token: env_opt("DASHSTATE_TOKEN"),
            public_dir: env_opt("DASHSTATE_PUBLIC_DIR").map(PathBuf::from),
            max_body_bytes: env_or("DASHSTATE_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        };
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn max_backups(mut self, max: usize) -> Self {
        self.max_backups = max;
        self
    }

    pub fn delta_thresholds(mut self, size_ratio: f64, key_ratio: f64) -> Self {
        self.delta_size_ratio = size_ratio;
        self.delta_key_ratio = key_ratio;
        self
    }

    pub fn bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    pub fn public_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.public_dir = Some(dir.into());
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_backups == 0 {
            return Err("max_backups must be > 0".to_string());
        }
        if !(self.delta_size_ratio > 0.0) || !(self.delta_key_ratio > 0.0) {
            return Err("delta thresholds must be positive".to_string());
        }
        if self.max_body_bytes == 0 {
            return Err("max_body_bytes must be > 0".to_string());
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn thresholds(&self) -> DeltaThresholds {
        DeltaThresholds {
            size_ratio: self.delta_size_ratio,
            key_ratio: self.delta_key_ratio,
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn primary_backup_dir(&self) -> PathBuf {
        self.data_dir.join("state_backups")
    }

    pub fn secondary_backup_dir(&self) -> PathBuf {
        self.data_dir.join("backup_backup").join("state_backups")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

// ============================================================================
// Engine (client) configuration
// ============================================================================

/// Configuration of a client-side [`crate::client::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the state server. `None` means an offline context: the
    /// remote tier is never contacted.
    pub remote_url: Option<String>,
    pub bearer_token: Option<String>,

    /// Quiet window of the push scheduler.
    pub debounce: Duration,

    /// Upper bound for every remote pull or push.
    pub remote_timeout: Duration,

    /// Period of the automatic local snapshot, once started.
    pub snapshot_interval: Duration,

    pub meta_key: String,
    pub reserved_prefix: String,
    pub app_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            bearer_token: None,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
            snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS),
            meta_key: DEFAULT_META_KEY.to_string(),
            reserved_prefix: DEFAULT_RESERVED_PREFIX.to_string(),
            app_version: APP_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            remote_url: env_opt("DASHSTATE_REMOTE_URL"),
            bearer_token: env_opt("DASHSTATE_TOKEN"),
            debounce: Duration::from_millis(env_or("DASHSTATE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?),
            remote_timeout: Duration::from_millis(env_or(
                "DASHSTATE_REMOTE_TIMEOUT_MS",
                DEFAULT_REMOTE_TIMEOUT_MS,
            )?),
            snapshot_interval: Duration::from_secs(env_or(
                "DASHSTATE_SNAPSHOT_INTERVAL_SECS",
                DEFAULT_SNAPSHOT_INTERVAL_SECS,
            )?),
            ..defaults
        })
    }

    pub fn remote_url(mut self, url: &str) -> Self {
        self.remote_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn snapshot_interval(mut self, every: Duration) -> Self {
        self.snapshot_interval = every;
        self
    }

    pub fn meta_key(mut self, key: &str) -> Self {
        self.meta_key = key.to_string();
        self
    }

    pub fn reserved_prefix(mut self, prefix: &str) -> Self {
        self.reserved_prefix = prefix.to_string();
        self
    }

    pub fn app_version(mut self, version: &str) -> Self {
        self.app_version = version.to_string();
        self
    }
}
