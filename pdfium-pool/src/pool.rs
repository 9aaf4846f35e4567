//! Worker pool: session placement, backpressure and crash recovery.
//!
//! Every open document holds one slot of a pool-wide semaphore. Waiters are
//! served in FIFO order. A session stays on the worker it was placed on until
//! it is closed or that worker crashes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bridge::CallbackSet;
use crate::config::{BackendKind, PoolConfig, RestartPolicy};
use crate::error::{PoolError, PoolResult};
use crate::handle::{SessionId, WorkerId};
use crate::protocol::{NativeRequest, NativeResponse};
use crate::registry::HandleRegistry;
use crate::worker::{
    BackendFactory, CallTarget, Worker, WorkerState, WorkerStats, backend_factory,
};

/// A document slot granted by [`WorkerPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLease {
    pub session: SessionId,
    pub worker: WorkerId,
    pub generation: u64,
}

struct Lease {
    worker: WorkerId,
    _slot: Slot,
}

/// A taken document slot, settled with [`Capacity::settle`] when dropped.
struct Slot {
    capacity: Arc<Capacity>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.capacity.settle(permit);
        }
    }
}

/// Slots taken out of the pool for a worker that stays crashed.
#[derive(Debug, Clone, Copy)]
struct Withdrawal {
    forgotten: usize,
    /// Slots that were held elsewhere when the worker was withdrawn; they
    /// are kept back as they are returned
    owed: usize,
}

/// Pool-wide document slots.
///
/// `changed` wakes callers that hold a slot but found no worker able to take
/// their session: it fires whenever a session ends, a worker comes back or
/// capacity is withdrawn.
struct Capacity {
    slots: Arc<Semaphore>,
    per_worker: usize,
    withdrawn: Mutex<HashMap<WorkerId, Withdrawal>>,
    changed: Notify,
}

impl Capacity {
    fn new(size: usize, per_worker: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size * per_worker)),
            per_worker,
            withdrawn: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    fn is_withdrawn(&self, worker: WorkerId) -> bool {
        self.withdrawn.lock().contains_key(&worker)
    }

    /// Take a worker's share of slots out of the pool. Returns `false` if it
    /// was already withdrawn.
    fn withdraw(&self, worker: WorkerId) -> bool {
        let withdrawal = {
            let mut withdrawn = self.withdrawn.lock();
            if withdrawn.contains_key(&worker) {
                return false;
            }
            let forgotten = self.slots.forget_permits(self.per_worker);
            let withdrawal = Withdrawal {
                forgotten,
                owed: self.per_worker - forgotten,
            };
            withdrawn.insert(worker, withdrawal);
            withdrawal
        };
        error!(
            worker = %worker,
            forgotten = withdrawal.forgotten,
            owed = withdrawal.owed,
            "Worker stays crashed, capacity withdrawn"
        );
        self.changed.notify_waiters();
        true
    }

    /// Give a withdrawn worker's slots back. Returns how many came back.
    fn restore(&self, worker: WorkerId) -> usize {
        let Some(withdrawal) = self.withdrawn.lock().remove(&worker) else {
            return 0;
        };
        self.slots.add_permits(withdrawal.forgotten);
        info!(worker = %worker, restored = withdrawal.forgotten, "Capacity restored");
        self.changed.notify_waiters();
        withdrawal.forgotten
    }

    /// Return a slot, or keep it back if a withdrawn worker still owes one.
    fn settle(&self, permit: OwnedSemaphorePermit) {
        let kept = {
            let mut withdrawn = self.withdrawn.lock();
            match withdrawn.values_mut().find(|w| w.owed > 0) {
                Some(withdrawal) => {
                    withdrawal.owed -= 1;
                    withdrawal.forgotten += 1;
                    true
                }
                None => false,
            }
        };
        if kept {
            permit.forget();
        } else {
            drop(permit);
        }
        self.changed.notify_waiters();
    }
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub backend: BackendKind,
    pub capacity: usize,
    pub available_slots: usize,
    pub sessions: usize,
    pub handles: usize,
    pub withdrawn_workers: usize,
    pub workers: Vec<WorkerStats>,
}

pub struct WorkerPool {
    config: PoolConfig,
    registry: Arc<HandleRegistry>,
    workers: Vec<Arc<Worker>>,
    capacity: Arc<Capacity>,
    leases: DashMap<SessionId, Lease>,
    /// Serializes worker selection so two sessions never race for the last
    /// slot of one worker
    assign: Mutex<()>,
}

impl WorkerPool {
    /// Validate `config` and start every worker.
    pub async fn start(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let factory = backend_factory(&config)?;
        Self::with_factory(config, factory).await
    }

    pub(crate) async fn with_factory(
        config: PoolConfig,
        factory: BackendFactory,
    ) -> PoolResult<Self> {
        let registry = Arc::new(HandleRegistry::new(config.closed_document_memory));

        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let worker = Worker::start(
                WorkerId::new(index),
                Arc::clone(&factory),
                Arc::clone(&registry),
                config.call_timeout(),
            )
            .await;
            match worker {
                Ok(worker) => workers.push(Arc::new(worker)),
                Err(e) => {
                    error!(worker = index, error = %e, "Failed to start worker");
                    for started in &workers {
                        started.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            backend = %config.backend,
            size = config.size,
            capacity = config.capacity(),
            "Worker pool started"
        );
        Ok(Self {
            capacity: Arc::new(Capacity::new(config.size, config.sessions_per_worker)),
            config,
            registry,
            workers,
            leases: DashMap::new(),
            assign: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub(crate) fn worker(&self, id: WorkerId) -> PoolResult<Arc<Worker>> {
        self.workers
            .get(id.index())
            .cloned()
            .ok_or_else(|| PoolError::Internal {
                message: format!("unknown {}", id),
            })
    }

    /// Reserve a document slot, waiting up to `timeout` behind earlier
    /// callers, and open a session on the least-loaded healthy worker.
    ///
    /// A slot can be free while no worker can take the session yet (its
    /// worker is restarting). The caller keeps the slot and waits for a
    /// worker until the same deadline.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<SessionLease> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let slot = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.capacity.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Slot {
                capacity: Arc::clone(&self.capacity),
                permit: Some(permit),
            },
            Ok(Err(_)) => return Err(PoolError::NoHealthyWorker),
            Err(_) => return Err(exhausted(started)),
        };

        let worker = loop {
            let changed = self.capacity.changed.notified();
            if let Some(worker) = self.place() {
                break worker;
            }
            if !self.can_recover() {
                return Err(PoolError::NoHealthyWorker);
            }
            debug!("Slot free but no worker can take a session yet");
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(exhausted(started));
            }
        };
        histogram!("pdfium_pool_acquire_wait_seconds").record(started.elapsed().as_secs_f64());

        let generation = worker.generation();
        let session = self.registry.open_session(worker.id(), generation);
        self.leases.insert(
            session,
            Lease {
                worker: worker.id(),
                _slot: slot,
            },
        );
        debug!(session = %session, worker = %worker.id(), "Session placed");

        Ok(SessionLease {
            session,
            worker: worker.id(),
            generation,
        })
    }

    /// Healthy worker with the fewest sessions that has room for one more,
    /// with that session already counted.
    fn place(&self) -> Option<Arc<Worker>> {
        let _assign = self.assign.lock();
        let worker = self
            .workers
            .iter()
            .filter(|w| w.is_healthy() && w.sessions() < self.config.sessions_per_worker)
            .min_by_key(|w| (w.sessions(), w.in_flight()))
            .cloned()?;
        worker.add_session();
        Some(worker)
    }

    /// Whether any worker is running or may still come back.
    fn can_recover(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.state() != WorkerState::Stopped && !self.capacity.is_withdrawn(w.id()))
    }

    /// Give a session's slot back. Returns `false` if it held none, for
    /// example because its worker crashed.
    pub fn release(&self, session: SessionId) -> bool {
        match self.leases.remove(&session) {
            Some((_, lease)) => {
                if let Ok(worker) = self.worker(lease.worker) {
                    worker.remove_session();
                }
                debug!(session = %session, worker = %lease.worker, "Session released");
                true
            }
            None => false,
        }
    }

    /// Worker that owns `session`.
    pub fn session_worker(&self, session: SessionId) -> Option<WorkerId> {
        self.leases.get(&session).map(|lease| lease.worker)
    }

    /// Healthy worker with the fewest calls in flight, for calls that touch
    /// no session.
    pub(crate) fn any_worker(&self) -> PoolResult<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| w.is_healthy())
            .min_by_key(|w| w.in_flight())
            .cloned()
            .ok_or(PoolError::NoHealthyWorker)
    }

    /// Run a request on `worker`, starting recovery if it failed fatally.
    pub(crate) async fn execute(
        &self,
        worker: &Arc<Worker>,
        request: NativeRequest,
        target: CallTarget,
        session: Option<SessionId>,
        callbacks: CallbackSet,
    ) -> PoolResult<NativeResponse> {
        let result = worker.execute(request, target, session, callbacks).await;
        if let Err(e) = &result
            && e.is_worker_fatal()
        {
            self.handle_worker_failure(worker);
        }
        result
    }

    /// Force-close everything on `worker` and give its slots back.
    fn invalidate_worker(&self, worker: &Worker) -> usize {
        let sessions = worker.invalidate();
        for session in &sessions {
            self.leases.remove(session);
        }
        sessions.len()
    }

    /// Crash path: drop the worker's sessions now, restart it in the
    /// background according to the restart policy.
    pub(crate) fn handle_worker_failure(&self, worker: &Arc<Worker>) {
        counter!("pdfium_pool_crashes_total", "backend" => worker.kind().to_string()).increment(1);
        let sessions = self.invalidate_worker(worker);
        warn!(worker = %worker.id(), sessions, "Recovering crashed worker");

        let policy = self.config.restart.clone();
        if !policy.enabled || worker.restarts() >= policy.max_restarts {
            warn!(worker = %worker.id(), restarts = worker.restarts(), "Not restarting worker");
            self.capacity.withdraw(worker.id());
            return;
        }

        let worker = Arc::clone(worker);
        let capacity = Arc::clone(&self.capacity);
        tokio::spawn(async move {
            if respawn_with_policy(&worker, &policy).await {
                capacity.changed.notify_waiters();
            } else {
                capacity.withdraw(worker.id());
            }
        });
    }

    /// Restart a worker now: its sessions are closed and their slots freed.
    /// A worker whose capacity was withdrawn gets it back.
    pub async fn restart(&self, worker: WorkerId) -> PoolResult<()> {
        let worker = self.worker(worker)?;
        let sessions = self.invalidate_worker(&worker);
        info!(worker = %worker.id(), sessions, "Restarting worker");
        worker.respawn(Duration::ZERO).await?;
        if self.capacity.restore(worker.id()) == 0 {
            self.capacity.changed.notify_waiters();
        }
        Ok(())
    }

    /// Probe every worker and recover the ones that died while idle.
    pub async fn check_health(&self) -> usize {
        let mut healthy = 0;
        for worker in &self.workers {
            let was_healthy = worker.is_healthy();
            if worker.check_alive().await {
                healthy += 1;
            } else if was_healthy {
                self.handle_worker_failure(worker);
            }
        }
        healthy
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            backend: self.config.backend,
            capacity: self.config.capacity(),
            available_slots: self.capacity.slots.available_permits(),
            sessions: self.leases.len(),
            handles: self.registry.handle_count(),
            withdrawn_workers: self.capacity.withdrawn.lock().len(),
            workers: self.workers.iter().map(|w| w.stats()).collect(),
        }
    }

    /// Refuse new sessions and stop every worker.
    pub async fn shutdown(&self) {
        self.capacity.slots.close();
        for worker in &self.workers {
            if worker.state() != WorkerState::Stopped {
                worker.shutdown().await;
            }
        }
        self.leases.clear();
        self.capacity.changed.notify_waiters();
        info!("Worker pool stopped");
    }
}

fn exhausted(started: Instant) -> PoolError {
    let waited_ms = started.elapsed().as_millis() as u64;
    counter!("pdfium_pool_acquire_timeouts_total").increment(1);
    warn!(waited_ms, "Pool exhausted");
    PoolError::PoolExhausted { waited_ms }
}

/// Respawn until it works or the policy runs out. Returns whether the worker
/// came back.
async fn respawn_with_policy(worker: &Worker, policy: &RestartPolicy) -> bool {
    while worker.restarts() < policy.max_restarts {
        match worker.respawn(policy.backoff()).await {
            Ok(()) => return true,
            Err(e) => warn!(worker = %worker.id(), error = %e, "Restart attempt failed"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LibraryKind, LibrarySettings};
    use crate::handle::HandleKind;
    use crate::native::sample_document;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_config(size: usize, sessions_per_worker: usize) -> PoolConfig {
        PoolConfig {
            size,
            sessions_per_worker,
            library: LibrarySettings {
                kind: LibraryKind::Memory,
                path: None,
            },
            restart: RestartPolicy {
                enabled: true,
                max_restarts: 2,
                backoff_ms: 0,
            },
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sessions_go_to_least_loaded_worker() {
        let pool = WorkerPool::start(memory_config(3, 2)).await.unwrap();

        let a = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let c = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let mut workers = vec![a.worker, b.worker, c.worker];
        workers.sort();
        workers.dedup();
        assert_eq!(workers.len(), 3);

        assert!(pool.release(b.session));
        assert!(!pool.release(b.session));
        let d = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(d.worker, b.worker);
        assert_eq!(pool.stats().sessions, 3);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let pool = WorkerPool::start(memory_config(1, 1)).await.unwrap();
        let held = pool.acquire(Duration::from_millis(10)).await.unwrap();

        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { waited_ms } if waited_ms >= 20));

        pool.release(held.session);
        assert!(pool.acquire(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let pool = Arc::new(WorkerPool::start(memory_config(1, 1)).await.unwrap());
        let held = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for n in 0..3 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
                order.lock().push(n);
                pool.release(lease.session);
            }));
            // Let each waiter queue before the next one starts
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.release(held.session);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_restart_drops_sessions_and_bumps_generation() {
        let pool = WorkerPool::start(memory_config(1, 2)).await.unwrap();
        let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let worker = pool.worker(lease.worker).unwrap();

        let document = match pool
            .execute(
                &worker,
                NativeRequest::LoadDocument {
                    data: sample_document(&["x"], None),
                    password: None,
                },
                CallTarget::anchored(lease.generation, HandleKind::Document),
                Some(lease.session),
                CallbackSet::none(),
            )
            .await
            .unwrap()
        {
            NativeResponse::Document { document } => document,
            other => panic!("unexpected {:?}", other),
        };
        let handle = pool
            .registry()
            .register(
                lease.worker,
                lease.generation,
                Some(lease.session),
                document,
                HandleKind::Document,
            )
            .unwrap();

        pool.restart(lease.worker).await.unwrap();

        assert_eq!(worker.generation(), lease.generation + 1);
        assert_eq!(pool.stats().available_slots, 2);
        assert!(!pool.release(lease.session));
        assert_eq!(
            pool.registry()
                .resolve(handle, HandleKind::Document, None)
                .unwrap_err(),
            PoolError::HandleNotFound {
                kind: HandleKind::Document
            }
        );
    }

    #[tokio::test]
    async fn test_stateless_calls_use_any_worker() {
        let pool = WorkerPool::start(memory_config(2, 1)).await.unwrap();
        let worker = pool.any_worker().unwrap();
        let response = pool
            .execute(
                &worker,
                NativeRequest::GetDefaultTtfMap,
                CallTarget::stateless(),
                None,
                CallbackSet::none(),
            )
            .await
            .unwrap();
        assert!(matches!(response, NativeResponse::TtfMap { entries } if !entries.is_empty()));

        pool.shutdown().await;
        assert!(matches!(pool.any_worker(), Err(PoolError::NoHealthyWorker)));
        assert_eq!(
            pool.acquire(Duration::from_millis(10)).await.unwrap_err(),
            PoolError::NoHealthyWorker
        );
    }

    /// Factory whose spawns fail for the attempts listed in `failing`.
    fn flaky_factory(failing: &'static [usize]) -> BackendFactory {
        let attempts = Arc::new(AtomicUsize::new(0));
        let inner = crate::worker::tests::memory_factory();
        Arc::new(move |worker| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if failing.contains(&attempt) {
                return Err(PoolError::Internal {
                    message: format!("attempt {}", attempt),
                });
            }
            inner(worker)
        })
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_restart_returns_withdrawn_capacity() {
        let mut config = memory_config(1, 2);
        config.restart.enabled = false;
        let pool = WorkerPool::start(config).await.unwrap();
        let worker = pool.worker(WorkerId::new(0)).unwrap();

        pool.handle_worker_failure(&worker);
        assert_eq!(pool.stats().available_slots, 0);
        assert_eq!(pool.stats().withdrawn_workers, 1);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(PoolError::PoolExhausted { .. })
        ));

        pool.restart(worker.id()).await.unwrap();
        assert_eq!(pool.stats().available_slots, 2);
        assert_eq!(pool.stats().withdrawn_workers, 0);
        let a = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_ne!(a.session, b.session);
    }

    #[tokio::test]
    async fn test_failed_background_restart_withdraws_capacity() {
        let mut config = memory_config(1, 1);
        config.restart.max_restarts = 1;
        // Attempt 0 starts the pool, attempt 1 is the background restart
        let pool = WorkerPool::with_factory(config, flaky_factory(&[1]))
            .await
            .unwrap();
        let worker = pool.worker(WorkerId::new(0)).unwrap();

        pool.handle_worker_failure(&worker);
        wait_for(|| pool.stats().withdrawn_workers == 1).await;
        assert_eq!(pool.stats().available_slots, 0);

        pool.restart(worker.id()).await.unwrap();
        assert_eq!(pool.stats().available_slots, 1);
        let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(lease.worker, worker.id());
    }

    #[test]
    fn test_withdrawal_keeps_back_slots_held_elsewhere() {
        let capacity = Capacity::new(2, 1);
        let held: Vec<_> = (0..2)
            .map(|_| Arc::clone(&capacity.slots).try_acquire_owned().unwrap())
            .collect();

        assert!(capacity.withdraw(WorkerId::new(0)));
        assert!(!capacity.withdraw(WorkerId::new(0)));
        assert_eq!(capacity.slots.available_permits(), 0);

        // The first slot handed back covers the withdrawn worker's share
        let mut held = held.into_iter();
        capacity.settle(held.next().unwrap());
        assert_eq!(capacity.slots.available_permits(), 0);
        capacity.settle(held.next().unwrap());
        assert_eq!(capacity.slots.available_permits(), 1);

        assert_eq!(capacity.restore(WorkerId::new(0)), 1);
        assert_eq!(capacity.slots.available_permits(), 2);
        assert_eq!(capacity.restore(WorkerId::new(0)), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_restarting_worker() {
        let mut config = memory_config(2, 1);
        config.restart.backoff_ms = 300;
        let pool = Arc::new(WorkerPool::start(config).await.unwrap());
        let a = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let crashed = pool.worker(a.worker).unwrap();

        // The crash frees a slot while its worker is still in backoff
        pool.handle_worker_failure(&crashed);
        assert_eq!(pool.stats().available_slots, 1);

        let started = Instant::now();
        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(lease.worker, crashed.id());
        assert_eq!(lease.generation, a.generation + 1);
    }

    #[tokio::test]
    async fn test_acquire_gives_up_at_deadline_while_worker_restarts() {
        let mut config = memory_config(1, 1);
        config.restart.backoff_ms = 500;
        let pool = WorkerPool::start(config).await.unwrap();
        let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
        pool.handle_worker_failure(&pool.worker(lease.worker).unwrap());

        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { waited_ms } if waited_ms >= 50));
        // The slot taken while waiting went back
        assert_eq!(pool.stats().available_slots, 1);
    }
}
