// ============================================================================
// dashstate
// ============================================================================
//
// State synchronization and backup engine for a single-document dashboard:
// a three-tier client (Fast Cache, Durable Store, Remote Store) with startup
// reconciliation and debounced pushes, and a state server that keeps
// retention-bounded backups of significant changes.

pub mod client;
pub mod config;
pub mod core;
pub mod server;

// Re-export main types for convenience
pub use config::{EngineConfig, ServerConfig};
pub use core::{Document, Envelope, ExportEnvelope, MetaRecord, Result, SyncError};

// Re-export client API
pub use client::{
    ChangeEvent, ChangeOrigin, DurableStore, FastCache, PushScheduler, ReconcileReport,
    RemoteStore, SnapshotSink, SyncEngine,
};

// Re-export server API
pub use server::{
    AppState, BackupSource, DeltaThresholds, StateStore, build_router, is_great_delta,
};
