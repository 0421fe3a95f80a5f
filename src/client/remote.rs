//! Remote Store client: the authoritative copy held by the state server.

use crate::config::EngineConfig;
use crate::core::{Document, ENVELOPE_VERSION, Envelope, Result, SyncError};
use crate::server::{BackupEntry, BackupListing, BackupSource};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current canonical document; empty when the server has none.
    async fn pull(&self) -> Result<Document>;

    /// Replaces canonical state with `data`.
    async fn push(&self, data: &Document) -> Result<()>;

    async fn list_backups(&self) -> Result<BackupListing>;

    async fn restore_backup(&self, name: &str, source: BackupSource) -> Result<()>;

    /// Stores `backup` as a backup entry; returns its name.
    async fn upload_backup(&self, hint: Option<&str>, backup: &Value) -> Result<String>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    uploaded: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::RemoteUnreachable(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    /// `None` when the config describes an offline context.
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>> {
        config
            .remote_url
            .as_deref()
            .map(|url| Self::new(url, config.bearer_token.clone(), config.remote_timeout))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_err(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::RemoteTimeout(self.timeout.as_millis() as u64)
        } else {
            SyncError::RemoteUnreachable(err.to_string())
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|err| self.map_err(err))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(SyncError::RemoteRejected {
                status: response.status().as_u16(),
            })
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|err| self.map_err(err))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn pull(&self) -> Result<Document> {
        let payload: Value = self.send_json(self.client.get(self.url("/api/state"))).await?;
        Ok(match payload.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => Document::new(),
        })
    }

    async fn push(&self, data: &Document) -> Result<()> {
        let body = json!({ "version": ENVELOPE_VERSION, "data": data });
        self.send(self.client.post(self.url("/api/state")).json(&body))
            .await?;
        Ok(())
    }

    async fn list_backups(&self) -> Result<BackupListing> {
        self.send_json(self.client.get(self.url("/api/state/backups")))
            .await
    }

    async fn restore_backup(&self, name: &str, source: BackupSource) -> Result<()> {
        let body = json!({ "name": name, "source": source });
        self.send(
            self.client
                .post(self.url("/api/state/backups/restore"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn upload_backup(&self, hint: Option<&str>, backup: &Value) -> Result<String> {
        let body = json!({ "name": hint, "backup": backup });
        let response: UploadResponse = self
            .send_json(
                self.client
                    .post(self.url("/api/state/backups/upload"))
                    .json(&body),
            )
            .await?;
        Ok(response.uploaded)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default)]
struct MemoryRemoteInner {
    data: Document,
    pushes: Vec<Document>,
    backups: BTreeMap<String, Document>,
    push_delay: Option<Duration>,
}

/// Stand-in for a server, with counters and an outage switch.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<MemoryRemoteInner>,
    offline: AtomicBool,
    pulls: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Document) -> Self {
        let store = Self::default();
        store.lock().data = data;
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRemoteInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteUnreachable(
                "memory remote switched offline".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every push waits this long before it is applied.
    pub fn set_push_delay(&self, delay: Duration) {
        self.lock().push_delay = Some(delay);
    }

    pub fn data(&self) -> Document {
        self.lock().data.clone()
    }

    pub fn push_count(&self) -> usize {
        self.lock().pushes.len()
    }

    pub fn pushes(&self) -> Vec<Document> {
        self.lock().pushes.clone()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn insert_backup(&self, name: &str, data: Document) {
        self.lock().backups.insert(name.to_string(), data);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn pull(&self) -> Result<Document> {
        self.check()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self.data())
    }

    async fn push(&self, data: &Document) -> Result<()> {
        self.check()?;
        let delay = self.lock().push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        inner.data = data.clone();
        inner.pushes.push(data.clone());
        Ok(())
    }

    async fn list_backups(&self) -> Result<BackupListing> {
        self.check()?;
        let primary = self
            .lock()
            .backups
            .iter()
            .rev()
            .map(|(name, data)| BackupEntry {
                name: name.clone(),
                source: BackupSource::Primary,
                size: serde_json::to_vec(data).map(|b| b.len() as u64).unwrap_or(0),
                modified_at: String::new(),
            })
            .collect();
        Ok(BackupListing {
            primary,
            secondary: Vec::new(),
        })
    }

    async fn restore_backup(&self, name: &str, _source: BackupSource) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        let data = inner
            .backups
            .get(name)
            .cloned()
            .ok_or(SyncError::RemoteRejected { status: 400 })?;
        inner.data = data;
        Ok(())
    }

    async fn upload_backup(&self, hint: Option<&str>, backup: &Value) -> Result<String> {
        self.check()?;
        let data = Envelope::decode_data(backup).ok_or(SyncError::RemoteRejected { status: 400 })?;
        let mut inner = self.lock();
        let name = format!(
            "upload_{:03}_{}",
            inner.backups.len(),
            hint.unwrap_or("uploaded")
        );
        inner.backups.insert(name.clone(), data);
        Ok(name)
    }
}
