use async_trait::async_trait;
use dashstate::client::fast_cache;
use dashstate::client::{
    LocalOutcome, MemoryDurableStore, MemoryFastCache, MemoryRemoteStore, ReconcileState,
    RemoteOutcome, RemoteStore, SyncEngine,
};
use dashstate::core::Document;
use dashstate::server::{BackupListing, BackupSource};
use dashstate::{EngineConfig, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("test document must be an object")
}

fn seed(cache: &MemoryFastCache, data: Value) {
    for (key, value) in doc(data) {
        fast_cache::set(cache, &key, &value);
    }
}

fn engine(
    cache: &Arc<MemoryFastCache>,
    durable: &Arc<MemoryDurableStore>,
    remote: Option<Arc<dyn RemoteStore>>,
) -> SyncEngine {
    SyncEngine::new(
        EngineConfig::offline().debounce(Duration::from_millis(100)),
        cache.clone(),
        durable.clone(),
        remote,
    )
}

/// Never answers; used to exercise the remote timeout.
struct SilentRemote;

#[async_trait]
impl RemoteStore for SilentRemote {
    async fn pull(&self) -> Result<Document> {
        std::future::pending().await
    }

    async fn push(&self, _data: &Document) -> Result<()> {
        std::future::pending().await
    }

    async fn list_backups(&self) -> Result<BackupListing> {
        std::future::pending().await
    }

    async fn restore_backup(&self, _name: &str, _source: BackupSource) -> Result<()> {
        std::future::pending().await
    }

    async fn upload_backup(&self, _hint: Option<&str>, _backup: &Value) -> Result<String> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cold_start_hydrates_fast_cache_from_durable() {
    let cache = Arc::new(MemoryFastCache::new());
    let durable = Arc::new(MemoryDurableStore::with_entries(doc(json!({
        "todoTasks": [{"id": 1}],
        "ganttZoom": 3,
        "__scratch": "ignored",
    }))));
    let engine = engine(&cache, &durable, None);

    let report = engine.initialize(false).await;

    assert_eq!(
        report.states,
        vec![
            ReconcileState::Init,
            ReconcileState::LocalMerge,
            ReconcileState::RemoteReconcile,
            ReconcileState::Ready,
        ]
    );
    assert_eq!(report.local, LocalOutcome::HydratedFromDurable { keys: 2 });
    assert_eq!(report.remote, RemoteOutcome::Offline);
    assert!(engine.is_ready());
    assert_eq!(engine.get("todoTasks", json!([])), json!([{"id": 1}]));
    assert_eq!(engine.get("ganttZoom", json!(1)), json!(3));
    assert!(engine.get_value("__scratch").is_none());
}

#[tokio::test]
async fn test_warm_fast_cache_is_mirrored_into_durable() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"quickLinks": ["a"], "hobbyTracker": {"run": 2}}));
    let durable = Arc::new(MemoryDurableStore::new());
    let engine = engine(&cache, &durable, None);

    let report = engine.initialize(false).await;

    assert_eq!(report.local, LocalOutcome::MirroredToDurable { keys: 2 });
    let stored = durable.snapshot().await;
    assert_eq!(stored["quickLinks"], json!(["a"]));
    assert_eq!(stored["hobbyTracker"], json!({"run": 2}));
}

#[tokio::test(start_paused = true)]
async fn test_non_empty_remote_replaces_local_state() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(
        &cache,
        json!({"todoTasks": ["local"], "localOnly": true, "__session": "keep"}),
    );
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::with_data(doc(json!({
        "todoTasks": ["remote"],
        "journalEntries": [],
    }))));
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let report = engine.initialize(false).await;

    assert_eq!(report.remote, RemoteOutcome::AppliedRemote { keys: 2 });
    assert_eq!(
        engine.snapshot(),
        doc(json!({"todoTasks": ["remote"], "journalEntries": []}))
    );
    assert_eq!(engine.get("__session", Value::Null), json!("keep"));
    assert_eq!(
        durable.snapshot().await,
        doc(json!({"todoTasks": ["remote"], "journalEntries": []}))
    );

    // adopting remote state must not echo it back
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(remote.push_count(), 0);
}

#[tokio::test]
async fn test_empty_remote_is_bootstrapped_from_local_state() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"todoTasks": [1, 2]}));
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let report = engine.initialize(false).await;

    assert_eq!(report.remote, RemoteOutcome::BootstrappedRemote { keys: 1 });
    assert_eq!(remote.data(), doc(json!({"todoTasks": [1, 2]})));
    assert_eq!(remote.push_count(), 1);
}

#[tokio::test]
async fn test_nothing_to_reconcile_when_every_tier_is_empty() {
    let cache = Arc::new(MemoryFastCache::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let report = engine.initialize(false).await;

    assert_eq!(report.local, LocalOutcome::HydratedFromDurable { keys: 0 });
    assert_eq!(report.remote, RemoteOutcome::NothingToDo);
    assert_eq!(remote.push_count(), 0);
    assert!(engine.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_remote_leaves_engine_usable() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"todoTasks": ["offline work"]}));
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_offline(true);
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let report = engine.initialize(false).await;

    assert!(matches!(report.remote, RemoteOutcome::Unreachable { .. }));
    assert!(engine.is_ready());
    assert_eq!(engine.get("todoTasks", json!([])), json!(["offline work"]));

    // the next write goes out once the server is back
    remote.set_offline(false);
    engine.set("ganttZoom", json!(2));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(remote.push_count(), 1);
    let pushed = remote.data();
    assert_eq!(pushed["todoTasks"], json!(["offline work"]));
    assert_eq!(pushed["ganttZoom"], json!(2));
    assert!(pushed.contains_key("appMeta"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_remote_times_out() {
    let cache = Arc::new(MemoryFastCache::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let engine = SyncEngine::new(
        EngineConfig::offline().remote_timeout(Duration::from_millis(250)),
        cache.clone(),
        durable.clone(),
        Some(Arc::new(SilentRemote)),
    );

    let report = engine.initialize(false).await;

    match report.remote {
        RemoteOutcome::Unreachable { error } => assert!(error.contains("250"), "{error}"),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(engine.is_ready());
}

#[tokio::test]
async fn test_reset_clears_local_tiers_before_merging() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"todoTasks": [1], "__device": "tablet"}));
    let durable = Arc::new(MemoryDurableStore::with_entries(doc(json!({"todoTasks": [1]}))));
    let engine = engine(&cache, &durable, None);

    let report = engine.initialize(true).await;

    assert!(report.was_reset());
    assert_eq!(report.states[1], ReconcileState::Reset);
    assert_eq!(report.local, LocalOutcome::HydratedFromDurable { keys: 0 });
    assert!(engine.snapshot().is_empty());
    assert!(durable.snapshot().await.is_empty());
    // reserved keys survive a reset
    assert_eq!(engine.get("__device", Value::Null), json!("tablet"));
}

#[tokio::test]
async fn test_reset_then_remote_restores_server_copy() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"todoTasks": ["stale"]}));
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::with_data(doc(json!({"todoTasks": ["server"]}))));
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let report = engine.initialize(true).await;

    assert!(report.was_reset());
    assert_eq!(report.remote, RemoteOutcome::AppliedRemote { keys: 1 });
    assert_eq!(engine.get("todoTasks", json!([])), json!(["server"]));
    assert_eq!(remote.push_count(), 0);
}

#[tokio::test]
async fn test_initialize_runs_once() {
    let cache = Arc::new(MemoryFastCache::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::with_data(doc(json!({"a": 1}))));
    let engine = engine(&cache, &durable, Some(remote.clone()));

    let (first, second) = tokio::join!(engine.initialize(false), engine.initialize(true));
    let third = engine.initialize(false).await;

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert!(!third.was_reset());
    assert_eq!(durable.open_count(), 1);
    assert_eq!(remote.pull_count(), 1);
    assert_eq!(engine.reconcile_report(), Some(&first));
}

#[tokio::test]
async fn test_failing_durable_store_is_skipped() {
    let cache = Arc::new(MemoryFastCache::new());
    seed(&cache, json!({"todoTasks": [1]}));
    let durable = Arc::new(MemoryDurableStore::new());
    durable.set_failing(true);
    let engine = engine(&cache, &durable, None);

    let report = engine.initialize(false).await;

    assert_eq!(report.local, LocalOutcome::DurableUnavailable);
    assert!(!engine.is_durable_available());
    assert!(engine.is_ready());

    engine.set("todoTasks", json!([1, 2]));
    assert_eq!(engine.get("todoTasks", json!([])), json!([1, 2]));
}

#[tokio::test]
async fn test_writes_before_ready_stay_in_fast_cache() {
    let cache = Arc::new(MemoryFastCache::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = engine(&cache, &durable, Some(remote.clone()));

    engine.set("todoTasks", json!(["early"]));
    engine.flush().await;

    assert!(durable.snapshot().await.is_empty());
    assert!(!engine.scheduler().is_pending());
    assert_eq!(remote.push_count(), 0);

    // the early write is part of the pre-sync state and seeds the server
    let report = engine.initialize(false).await;
    assert!(matches!(report.local, LocalOutcome::MirroredToDurable { .. }));
    assert!(matches!(report.remote, RemoteOutcome::BootstrappedRemote { .. }));
    assert_eq!(remote.data()["todoTasks"], json!(["early"]));
    assert_eq!(durable.snapshot().await["todoTasks"], json!(["early"]));
}
