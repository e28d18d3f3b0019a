//! Generic per-entity single-flight reconcile scheduler.
//!
//! Guarantees: coalescing (concurrent `schedule` calls for one id collapse
//! to a single future run), single-flight (no two runs for the same id
//! overlap), no ordering across distinct ids, exponential backoff on
//! handler error, and a bounded graceful shutdown.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Server,
    Image,
    Build,
    Deployment,
    Vm,
    Domain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: Uuid,
}

/// What a reconcile handler tells the scheduler to do next.
pub enum ReconcileOutcome {
    /// Converged; nothing further to do unless another event arrives.
    Done,
    /// Re-run at a fixed delay regardless of success/failure classification
    /// (e.g. "build has no image yet, check again in 10s").
    Requeue(Duration),
}

pub type Handler = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<ReconcileOutcome>> + Send + Sync>;

#[derive(Default)]
struct SchedEntry {
    running: bool,
    pending_run_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handlers: HashMap<EntityKind, Handler>,
    state: DashMap<EntityKey, SchedEntry>,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicU64,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(handlers: HashMap<EntityKind, Handler>, workers: usize, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers,
                state: DashMap::new(),
                semaphore: Arc::new(Semaphore::new(workers.max(1))),
                in_flight: AtomicU64::new(0),
                cancel,
            }),
        }
    }

    /// Schedule an immediate run (the WAL listener and bootstrap scan call
    /// this).
    pub fn schedule_now(&self, key: EntityKey) {
        self.schedule_at(key, Utc::now());
    }

    pub fn schedule_at(&self, key: EntityKey, run_at: DateTime<Utc>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let mut should_dispatch = false;
        {
            let mut entry = self.inner.state.entry(key).or_default();
            if entry.running {
                // Coalesce: record the earliest requested time, the running
                // handler's completion will dispatch it.
                entry.pending_run_at = Some(match entry.pending_run_at {
                    Some(existing) => existing.min(run_at),
                    None => run_at,
                });
            } else {
                entry.pending_run_at = Some(match entry.pending_run_at {
                    Some(existing) => existing.min(run_at),
                    None => run_at,
                });
                should_dispatch = true;
            }
        }
        if should_dispatch {
            self.spawn_dispatch_loop(key);
        }
    }

    /// A single logical worker per id: claims the pending run, executes it,
    /// and re-dispatches itself if another schedule arrived meanwhile --
    /// this is how single-flight + coalescing are enforced without a
    /// separate polling dispatcher thread.
    fn spawn_dispatch_loop(&self, key: EntityKey) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let run_at = {
                    let mut entry = this.inner.state.entry(key).or_default();
                    match entry.pending_run_at.take() {
                        Some(run_at) => {
                            entry.running = true;
                            run_at
                        }
                        None => {
                            entry.running = false;
                            return;
                        }
                    }
                };
                let now = Utc::now();
                if run_at > now {
                    if let Ok(delay) = (run_at - now).to_std() {
                        tokio::select! {
                            _ = this.inner.cancel.cancelled() => {
                                let mut entry = this.inner.state.entry(key).or_default();
                                entry.running = false;
                                entry.pending_run_at = Some(run_at);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                let Ok(permit) = this.inner.semaphore.clone().acquire_owned().await else {
                    return;
                };
                this.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let outcome = this.run_handler(key).await;
                this.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);

                let mut entry = this.inner.state.entry(key).or_default();
                match outcome {
                    Ok(ReconcileOutcome::Done) => {
                        entry.consecutive_failures = 0;
                    }
                    Ok(ReconcileOutcome::Requeue(delay)) => {
                        entry.consecutive_failures = 0;
                        let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                        entry.pending_run_at = Some(match entry.pending_run_at {
                            Some(existing) => existing.min(next),
                            None => next,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(?key.kind, id = %key.id, error = %e, "reconcile failed, backing off");
                        let failures = entry.consecutive_failures.min(16);
                        entry.consecutive_failures += 1;
                        let backoff = (BASE_BACKOFF * 2u32.pow(failures)).min(MAX_BACKOFF);
                        let next = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
                        entry.pending_run_at = Some(match entry.pending_run_at {
                            Some(existing) => existing.min(next),
                            None => next,
                        });
                    }
                }
                // loop again: if pending_run_at is now set (either a fresh
                // schedule arrived during the run, or we just set one above
                // for backoff/requeue), we keep the dispatch loop alive.
            }
        });
    }

    async fn run_handler(&self, key: EntityKey) -> Result<ReconcileOutcome> {
        let Some(handler) = self.inner.handlers.get(&key.kind) else {
            return Ok(ReconcileOutcome::Done);
        };
        let span = tracing::info_span!("reconcile", kind = ?key.kind, id = %key.id);
        let _guard = span.enter();
        handler(key.id).await
    }

    /// Waits for in-flight handlers to finish, up to `bound`.
    pub async fn stop(&self, bound: Duration) {
        self.inner.cancel.cancel();
        let deadline = tokio::time::Instant::now() + bound;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("scheduler shutdown bound exceeded with handlers still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(test)]
    pub fn run_count_for_test(&self, key: EntityKey) -> Option<u32> {
        self.inner.state.get(&key).map(|e| e.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn handlers_with(kind: EntityKind, handler: Handler) -> HashMap<EntityKind, Handler> {
        let mut m = HashMap::new();
        m.insert(kind, handler);
        m
    }

    #[tokio::test]
    async fn event_storm_collapses_to_single_flight_run() {
        let run_count = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        let rc = run_count.clone();
        let cc = concurrent.clone();
        let mc = max_concurrent.clone();
        let d = done.clone();
        let handler: Handler = Arc::new(move |_id| {
            let rc = rc.clone();
            let cc = cc.clone();
            let mc = mc.clone();
            let d = d.clone();
            Box::pin(async move {
                let now = cc.fetch_add(1, Ordering::SeqCst) + 1;
                mc.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                cc.fetch_sub(1, Ordering::SeqCst);
                let total = rc.fetch_add(1, Ordering::SeqCst) + 1;
                if total >= 1 {
                    d.notify_one();
                }
                Ok(ReconcileOutcome::Done)
            })
        });

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(handlers_with(EntityKind::Vm, handler), 8, cancel);
        let id = Uuid::now_v7();
        let key = EntityKey { kind: EntityKind::Vm, id };

        for _ in 0..200 {
            scheduler.schedule_now(key);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "single-flight violated");
        assert!(run_count.load(Ordering::SeqCst) >= 1);
        assert!(run_count.load(Ordering::SeqCst) < 200, "event storm should coalesce, not run 200 times");
    }

    #[tokio::test]
    async fn failure_backs_off_and_resets_on_success() {
        let attempt = Arc::new(AtomicUsize::new(0));
        let a = attempt.clone();
        let handler: Handler = Arc::new(move |_id| {
            let a = a.clone();
            Box::pin(async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(ReconcileOutcome::Done)
            })
        });
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(handlers_with(EntityKind::Image, handler), 4, cancel);
        let key = EntityKey { kind: EntityKind::Image, id: Uuid::now_v7() };
        scheduler.schedule_now(key);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempt.load(Ordering::SeqCst), 1, "should have failed once so far");
    }
}
