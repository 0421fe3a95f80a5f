//! Startup reconciliation across the three tiers.
//!
//! `Init -> (Reset) -> LocalMerge -> RemoteReconcile -> Ready`
//!
//! Runs once per engine. Every tier failure is logged and recorded in the
//! report; the protocol always reaches `Ready`.

use super::engine::{ChangeOrigin, SyncEngine, with_timeout};
use super::fast_cache;
use crate::core::{Document, is_reserved_key};
use std::sync::atomic::Ordering;
use tracing::{Level, event, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Init,
    Reset,
    LocalMerge,
    RemoteReconcile,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Fast Cache was empty and was filled from the Durable Store.
    HydratedFromDurable { keys: usize },
    /// Fast Cache had data and was copied into the Durable Store.
    MirroredToDurable { keys: usize },
    DurableUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// No remote configured.
    Offline,
    /// The remote document replaced the local one.
    AppliedRemote { keys: usize },
    /// The remote was empty and was seeded with the pre-sync local state.
    BootstrappedRemote { keys: usize },
    NothingToDo,
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub states: Vec<ReconcileState>,
    pub local: LocalOutcome,
    pub remote: RemoteOutcome,
}

impl ReconcileReport {
    pub fn was_reset(&self) -> bool {
        self.states.contains(&ReconcileState::Reset)
    }
}

impl SyncEngine {
    /// Runs the reconciliation protocol. Later calls (concurrent or not)
    /// return the report of the first run without touching any tier.
    pub async fn initialize(&self, reset: bool) -> ReconcileReport {
        self.report
            .get_or_init(|| self.reconcile(reset))
            .await
            .clone()
    }

    /// The report of the completed reconciliation, if any.
    pub fn reconcile_report(&self) -> Option<&ReconcileReport> {
        self.report.get()
    }

    async fn reconcile(&self, reset: bool) -> ReconcileReport {
        let mut states = vec![ReconcileState::Init];

        if let Err(err) = self.durable.open().await {
            warn!(error = %err, "durable store unavailable, continuing without it");
            self.durable_available.store(false, Ordering::SeqCst);
        }

        if reset {
            states.push(ReconcileState::Reset);
            self.clear_local();
            info!("local tiers reset");
        }

        let pre_state = fast_cache::snapshot(self.cache.as_ref(), &self.config.reserved_prefix);

        states.push(ReconcileState::LocalMerge);
        let local = self.merge_local(&pre_state).await;

        states.push(ReconcileState::RemoteReconcile);
        let remote = self.reconcile_remote(&pre_state).await;

        self.flush().await;
        self.ready.store(true, Ordering::SeqCst);
        states.push(ReconcileState::Ready);

        event!(Level::INFO, local = ?local, remote = ?remote, "reconciliation complete");
        ReconcileReport {
            states,
            local,
            remote,
        }
    }

    async fn merge_local(&self, pre_state: &Document) -> LocalOutcome {
        if !self.is_durable_available() {
            return LocalOutcome::DurableUnavailable;
        }

        if !pre_state.is_empty() {
            for (key, value) in pre_state {
                self.mirror.put(key, value);
            }
            return LocalOutcome::MirroredToDurable {
                keys: pre_state.len(),
            };
        }

        // queued clears from a reset must land before reading
        self.flush().await;
        match self.durable.get_all().await {
            Ok(stored) => {
                let mut keys = 0;
                for (key, value) in &stored {
                    if !is_reserved_key(key, &self.config.reserved_prefix) {
                        fast_cache::set(self.cache.as_ref(), key, value);
                        keys += 1;
                    }
                }
                LocalOutcome::HydratedFromDurable { keys }
            }
            Err(err) => {
                warn!(error = %err, "durable store read failed during startup");
                self.durable_available.store(false, Ordering::SeqCst);
                LocalOutcome::DurableUnavailable
            }
        }
    }

    async fn reconcile_remote(&self, pre_state: &Document) -> RemoteOutcome {
        let Some(remote) = self.remote.clone() else {
            return RemoteOutcome::Offline;
        };
        let timeout = self.config.remote_timeout;

        let remote_data = match with_timeout(timeout, remote.pull()).await {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "remote pull failed, staying on local tiers");
                return RemoteOutcome::Unreachable {
                    error: err.to_string(),
                };
            }
        };

        if !remote_data.is_empty() {
            self.apply_document(&remote_data, ChangeOrigin::Remote);
            return RemoteOutcome::AppliedRemote {
                keys: remote_data.len(),
            };
        }

        if pre_state.is_empty() {
            return RemoteOutcome::NothingToDo;
        }

        match with_timeout(timeout, remote.push(pre_state)).await {
            Ok(()) => RemoteOutcome::BootstrappedRemote {
                keys: pre_state.len(),
            },
            Err(err) => {
                warn!(error = %err, "bootstrapping the remote failed");
                RemoteOutcome::Unreachable {
                    error: err.to_string(),
                }
            }
        }
    }
}
