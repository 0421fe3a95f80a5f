//! Client side of the engine: the three replication tiers, the push
//! scheduler, startup reconciliation and the collaborator-facing API.

pub mod auto_snapshot;
pub mod durable;
pub mod engine;
pub mod fast_cache;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod sink;

pub use auto_snapshot::{AutoSnapshot, AutoSnapshotStats};
pub use durable::{DurableMirror, DurableStore, FileDurableStore, MemoryDurableStore};
pub use engine::{ChangeEvent, ChangeOrigin, SyncEngine};
pub use fast_cache::{FastCache, FileFastCache, MemoryFastCache};
pub use reconcile::{LocalOutcome, ReconcileReport, ReconcileState, RemoteOutcome};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use scheduler::{PushScheduler, SchedulerStats, SuppressGuard};
pub use sink::{FileSnapshotSink, MemorySnapshotSink, SinkError, SnapshotSink};
