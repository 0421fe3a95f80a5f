//! HTTP surface of the state server.

use super::backups::{BackupListing, BackupSource};
use super::state_store::StateStore;
use crate::config::ServerConfig;
use crate::core::{Document, Envelope, SyncError};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State, rejection::BytesRejection},
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    InvalidBackup(String),
    #[error("unknown backup source '{0}'")]
    InvalidBackupSource(String),
    #[error("{0}")]
    InvalidBackupPayload(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    UpstreamTimeout(String),
    #[error("{0}")]
    Storage(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_)
            | Self::InvalidState(_)
            | Self::InvalidBackup(_)
            | Self::InvalidBackupSource(_)
            | Self::InvalidBackupPayload(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidBackup(_) => "invalid_backup",
            Self::InvalidBackupSource(_) => "invalid_backup_source",
            Self::InvalidBackupPayload(_) => "invalid_backup_payload",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidBackupName(_)
            | SyncError::PathTraversalAttempt(_)
            | SyncError::RestoreOfMissingBackup(_) => Self::InvalidBackup(err.to_string()),
            SyncError::InvalidPayload(message) => Self::InvalidPayload(message),
            SyncError::PayloadTooLarge { limit } => Self::PayloadTooLarge { limit },
            SyncError::Unauthorized => Self::Unauthorized,
            SyncError::RemoteTimeout(_) => Self::UpstreamTimeout(err.to_string()),
            SyncError::RemoteUnreachable(_) | SyncError::RemoteRejected { .. } => {
                Self::UpstreamUnavailable(err.to_string())
            }
            SyncError::StorageCorrupt(_)
            | SyncError::DurableStoreUnavailable(_)
            | SyncError::Io(_)
            | SyncError::Serialization(_) => Self::Storage(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({
                "error": self.code(),
                "detail": self.to_string(),
            })),
        )
            .into_response()
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub bearer_token: Option<Arc<str>>,
    pub public_dir: Option<PathBuf>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<StateStore>, config: &ServerConfig) -> Self {
        Self {
            store,
            bearer_token: config.bearer_token.as_deref().map(Arc::from),
            public_dir: config.public_dir.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub async fn open(config: &ServerConfig) -> crate::core::Result<Self> {
        let store = StateStore::open(config).await?;
        Ok(Self::new(Arc::new(store), config))
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/state",
            get(get_state).post(post_state).options(no_content),
        )
        .route("/api/state/backups", get(list_backups).options(no_content))
        .route(
            "/api/state/backups/restore",
            post(restore_backup).options(no_content),
        )
        .route(
            "/api/state/backups/upload",
            post(upload_backup).options(no_content),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        );

    let router = Router::new().route("/health", get(health)).merge(api);
    let router = match &state.public_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(not_found),
    };

    router
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.bearer_token.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    if presented == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected request without valid bearer token");
        ApiError::Unauthorized.into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(request: Request) -> ApiError {
    ApiError::NotFound(format!("no route for {} {}", request.method(), request.uri().path()))
}

fn parse_body(body: Result<Bytes, BytesRejection>, limit: usize) -> Result<Value, ApiError> {
    let bytes = match body {
        Ok(bytes) => bytes,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(ApiError::PayloadTooLarge { limit });
        }
        Err(rejection) => return Err(ApiError::InvalidPayload(rejection.body_text())),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::InvalidPayload("request body is empty".to_string()));
    }
    serde_json::from_slice(&bytes).map_err(|err| ApiError::InvalidPayload(err.to_string()))
}

async fn get_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let data = state.store.load_data().await?;
    Ok(Json(json!({ "version": crate::core::ENVELOPE_VERSION, "data": data })))
}

/// Accepts `{data: {...}}` or a bare document.
fn state_from_payload(payload: &Value) -> Result<Document, ApiError> {
    if let Some(data) = payload.get("data")
        && !data.is_object()
    {
        return Err(ApiError::InvalidState("'data' must be a JSON object".to_string()));
    }
    Envelope::decode_data(payload)
        .ok_or_else(|| ApiError::InvalidState("state must be a JSON object".to_string()))
}

async fn post_state(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let payload = parse_body(body, state.max_body_bytes)?;
    let data = state_from_payload(&payload)?;
    state.store.save(data).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_backups(State(state): State<AppState>) -> Result<Json<BackupListing>, ApiError> {
    Ok(Json(state.store.list_backups().await?))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    name: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

async fn restore_backup(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let payload = parse_body(body, state.max_body_bytes)?;
    let request: RestoreRequest = serde_json::from_value(payload)
        .map_err(|err| ApiError::InvalidBackup(err.to_string()))?;

    let name = request
        .name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::InvalidBackup("backup name is required".to_string()))?;
    let source = BackupSource::parse(request.source.as_deref()).ok_or_else(|| {
        ApiError::InvalidBackupSource(request.source.clone().unwrap_or_default())
    })?;

    let outcome = state.store.restore(&name, source).await?;
    Ok(Json(json!({
        "ok": true,
        "restored": outcome.restored,
        "source": outcome.source,
    })))
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    backup: Option<Value>,
}

async fn upload_backup(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let payload = parse_body(body, state.max_body_bytes)?;
    let request: UploadRequest = serde_json::from_value(payload)
        .map_err(|err| ApiError::InvalidBackupPayload(err.to_string()))?;

    let backup = request
        .backup
        .filter(Value::is_object)
        .ok_or_else(|| ApiError::InvalidBackupPayload("'backup' must be a JSON object".to_string()))?;

    let name = state
        .store
        .upload(request.name.as_deref(), &backup)
        .await
        .map_err(|err| match err {
            SyncError::InvalidPayload(message) => ApiError::InvalidBackupPayload(message),
            other => ApiError::from(other),
        })?;

    Ok(Json(json!({ "ok": true, "uploaded": name })))
}
