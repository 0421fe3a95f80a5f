//! Debounced push scheduler.
//!
//! At most one timer is armed and at most one push runs at a time. A timer
//! that fires while a push is in flight is dropped; the next write arms a
//! fresh timer, so the latest state still goes out. An immediate push
//! requested during a flight leaves the armed timer alone and is re-armed
//! once the flight lands.

use crate::core::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type PushJob = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pushes refused because another push was in flight.
    pub dropped_in_flight: usize,
    /// `schedule` calls ignored because a suppression guard was alive.
    pub suppressed: usize,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    dropped_in_flight: AtomicUsize,
    suppressed: AtomicUsize,
}

struct Inner {
    debounce: Duration,
    in_flight: AtomicBool,
    suppressions: AtomicUsize,
    generation: AtomicU64,
    // (generation, timer task)
    pending: Mutex<Option<(u64, JoinHandle<()>)>>,
    // immediate push refused while another was in flight; released together with `in_flight`
    deferred: Mutex<Option<PushJob>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, Option<(u64, JoinHandle<()>)>> {
        lock(&self.pending)
    }

    fn is_suppressed(&self) -> bool {
        self.suppressions.load(Ordering::SeqCst) > 0
    }

    fn try_claim(&self) -> Option<InFlight<'_>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.counters.dropped_in_flight.fetch_add(1, Ordering::SeqCst);
            None
        } else {
            Some(InFlight(&self.in_flight))
        }
    }

    /// Runs `job` unless a push is already in flight. Returns whether it ran.
    async fn run_exclusive(self: &Arc<Self>, job: PushJob) -> Result<bool> {
        match self.try_claim() {
            Some(flight) => self.run_claimed(flight, job).await,
            None => {
                debug!("push skipped, another push is in flight");
                Ok(false)
            }
        }
    }

    async fn run_claimed(self: &Arc<Self>, flight: InFlight<'_>, job: PushJob) -> Result<bool> {
        let result = job().await;

        let deferred = {
            let mut deferred = lock(&self.deferred);
            drop(flight);
            deferred.take()
        };
        if let Some(job) = deferred {
            debug!("arming push requested during the previous flight");
            arm(self, job);
        }

        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}

/// Arms the quiet-window timer for `job`, replacing any pending one.
fn arm(inner: &Arc<Inner>, job: PushJob) -> bool {
    if inner.is_suppressed() {
        inner.counters.suppressed.fetch_add(1, Ordering::SeqCst);
        return false;
    }
    let mut pending = inner.pending();
    if let Some((_, handle)) = pending.take() {
        handle.abort();
    }

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let task_inner = inner.clone();
    let handle = tokio::spawn(async move {
        let inner = task_inner;
        tokio::time::sleep(inner.debounce).await;

        {
            let mut pending = inner.pending();
            let current = matches!(pending.as_ref(), Some((armed, _)) if *armed == generation);
            if !current {
                // superseded after the timer elapsed
                return;
            }
            pending.take();
        }

        if inner.is_suppressed() {
            inner.counters.suppressed.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if let Err(err) = inner.run_exclusive(job).await {
            warn!(error = %err, "scheduled push failed, next write will retry");
        }
    });

    *pending = Some((generation, handle));
    inner.counters.scheduled.fetch_add(1, Ordering::SeqCst);
    true
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Suppresses [`PushScheduler::schedule`] while alive.
pub struct SuppressGuard {
    inner: Arc<Inner>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.inner.suppressions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PushScheduler {
    inner: Arc<Inner>,
}

impl PushScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                debounce,
                in_flight: AtomicBool::new(false),
                suppressions: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
                deferred: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Arms the quiet-window timer for `job`, replacing any pending one.
    /// Returns `false` when suppressed. Must be called from within a tokio
    /// runtime.
    pub fn schedule<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        arm(&self.inner, Box::new(move || job().boxed()))
    }

    /// Cancels any armed timer and runs `job` immediately. While another push
    /// is in flight this returns `Ok(false)`, keeps the armed timer and arms
    /// `job` once that push lands.
    pub async fn run_now<F, Fut>(&self, job: F) -> Result<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job: PushJob = Box::new(move || job().boxed());
        let flight = {
            let mut deferred = lock(&self.inner.deferred);
            match self.inner.try_claim() {
                Some(flight) => flight,
                None => {
                    debug!("immediate push deferred behind the in-flight one");
                    *deferred = Some(job);
                    return Ok(false);
                }
            }
        };
        self.cancel();
        self.inner.run_claimed(flight, job).await
    }

    /// Disarms the pending timer, if any.
    pub fn cancel(&self) -> bool {
        match self.inner.pending().take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn suppress(&self) -> SuppressGuard {
        self.inner.suppressions.fetch_add(1, Ordering::SeqCst);
        SuppressGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.is_suppressed()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending().is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        SchedulerStats {
            scheduled: counters.scheduled.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            dropped_in_flight: counters.dropped_in_flight.load(Ordering::SeqCst),
            suppressed: counters.suppressed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for PushScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
