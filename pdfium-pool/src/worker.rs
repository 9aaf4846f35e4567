//! Workers: one isolated execution context each.
//!
//! A worker wraps a [`Backend`] behind a tokio mutex so that it never runs two
//! independent calls at once. The lock is taken before the call starts and
//! held until the call, including every callback round trip, has returned.
//! Nested operations issued from a callback do not take the lock again; they
//! run inside the backend's own call frame.

mod in_process;
mod process;
mod sandbox;
mod subprocess;

pub use process::serve;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::bridge::{CallContext, CallbackSet};
use crate::config::{BackendKind, LibrarySettings, PoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::handle::{HandleKind, SessionId, WorkerId};
use crate::native::{NativeResult, open_library};
use crate::protocol::{NativeRequest, NativeResponse};
use crate::registry::HandleRegistry;

use in_process::InProcessBackend;
use sandbox::SandboxBackend;
use subprocess::SubprocessBackend;

/// Liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Ready,
    Busy,
    Crashed,
    Restarting,
    Stopped,
}

/// Backend-specific half of a worker.
///
/// `execute` returns `Err` only for transport or isolation failures, after
/// which the backend is unusable. Native failures come back inside `Ok`.
pub(crate) trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn execute(
        &mut self,
        request: NativeRequest,
        context: &Arc<CallContext>,
    ) -> PoolResult<NativeResult<NativeResponse>>;

    fn is_healthy(&mut self) -> bool;

    fn shutdown(&mut self);

    /// Handle that can abort a call in flight from another thread.
    fn interrupter(&self) -> Interrupter;

    /// OS process the backend runs in, if it has one of its own.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Aborts a running call when its deadline expires.
#[derive(Clone)]
pub(crate) enum Interrupter {
    None,
    Process(Arc<Mutex<std::process::Child>>),
    Epoch(wasmtime::Engine),
}

impl Interrupter {
    fn interrupt(&self) {
        match self {
            Interrupter::None => {}
            Interrupter::Process(child) => {
                if let Err(e) = child.lock().kill() {
                    warn!(error = %e, "Failed to kill worker process");
                }
            }
            Interrupter::Epoch(engine) => engine.increment_epoch(),
        }
    }
}

/// Creates a fresh backend for a worker (at start and on restart).
pub(crate) type BackendFactory =
    Arc<dyn Fn(WorkerId) -> PoolResult<Box<dyn Backend>> + Send + Sync>;

/// Factory for the backend selected by `config`.
pub(crate) fn backend_factory(config: &PoolConfig) -> PoolResult<BackendFactory> {
    match config.backend {
        BackendKind::InProcess => {
            let settings = config.library.clone();
            Ok(Arc::new(move |_| {
                let library = open_library(&settings)?;
                Ok(Box::new(InProcessBackend::new(library)) as Box<dyn Backend>)
            }))
        }
        BackendKind::Subprocess => {
            let program = match &config.subprocess.program {
                Some(program) => program.clone(),
                None => default_worker_program()?,
            };
            let settings = config.library.clone();
            Ok(Arc::new(move |worker| {
                let backend = SubprocessBackend::spawn(worker, &program, &settings)?;
                Ok(Box::new(backend) as Box<dyn Backend>)
            }))
        }
        BackendKind::Sandbox => {
            let module_path = config
                .sandbox
                .module_path
                .clone()
                .ok_or_else(|| PoolError::Config {
                    message: "sandbox backend requires sandbox.module_path".to_string(),
                })?;
            Ok(Arc::new(move |worker| {
                let backend = SandboxBackend::spawn(worker, &module_path)?;
                Ok(Box::new(backend) as Box<dyn Backend>)
            }))
        }
    }
}

/// `pdfium-pool-worker` next to the running executable (or one level up,
/// where test binaries live).
fn default_worker_program() -> PoolResult<PathBuf> {
    let name = format!("pdfium-pool-worker{}", std::env::consts::EXE_SUFFIX);
    let exe = std::env::current_exe().map_err(|e| PoolError::Config {
        message: format!("Failed to locate current executable: {}", e),
    })?;
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| PoolError::Config {
            message: format!("{} not found next to {}", name, exe.display()),
        })
}

/// Generation and anchor of the handles a request was resolved from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallTarget {
    pub(crate) generation: Option<u64>,
    pub(crate) anchor: HandleKind,
}

impl CallTarget {
    pub(crate) fn stateless() -> Self {
        Self {
            generation: None,
            anchor: HandleKind::Document,
        }
    }

    pub(crate) fn anchored(generation: u64, anchor: HandleKind) -> Self {
        Self {
            generation: Some(generation),
            anchor,
        }
    }
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub backend: BackendKind,
    pub state: WorkerState,
    pub generation: u64,
    pub pid: Option<u32>,
    pub sessions: usize,
    pub in_flight: usize,
    pub executions: u64,
    pub failures: u64,
    pub crashes: u64,
    pub restarts: u32,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    failures: AtomicU64,
    crashes: AtomicU64,
}

pub(crate) struct Worker {
    id: WorkerId,
    kind: BackendKind,
    backend: Arc<tokio::sync::Mutex<Box<dyn Backend>>>,
    interrupter: Mutex<Interrupter>,
    pid: Mutex<Option<u32>>,
    state: Mutex<WorkerState>,
    generation: AtomicU64,
    sessions: AtomicUsize,
    in_flight: AtomicUsize,
    restarts: AtomicU32,
    counters: Counters,
    call_timeout: Option<Duration>,
    registry: Arc<HandleRegistry>,
    factory: BackendFactory,
}

impl Worker {
    /// Start a worker with a fresh backend.
    pub(crate) async fn start(
        id: WorkerId,
        factory: BackendFactory,
        registry: Arc<HandleRegistry>,
        call_timeout: Option<Duration>,
    ) -> PoolResult<Self> {
        let backend = spawn_backend(&factory, id).await?;
        let kind = backend.kind();
        let interrupter = backend.interrupter();
        let pid = backend.pid();
        info!(worker = %id, backend = %kind, pid, "Worker started");

        Ok(Self {
            id,
            kind,
            backend: Arc::new(tokio::sync::Mutex::new(backend)),
            interrupter: Mutex::new(interrupter),
            pid: Mutex::new(pid),
            state: Mutex::new(WorkerState::Ready),
            generation: AtomicU64::new(registry.generation(id)),
            sessions: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            restarts: AtomicU32::new(0),
            counters: Counters::default(),
            call_timeout,
            registry,
            factory,
        })
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.kind
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    pub(crate) fn is_healthy(&self) -> bool {
        matches!(self.state(), WorkerState::Ready | WorkerState::Busy)
    }

    pub(crate) fn supports(&self, request: &NativeRequest) -> bool {
        self.kind.supports(request.operation())
    }

    pub(crate) fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub(crate) fn add_session(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one session less. The count is reset when the worker is
    /// invalidated, so it never goes below zero.
    pub(crate) fn remove_session(&self) {
        if self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(worker = %self.id, "Session released on a worker with no sessions");
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Run one request to completion, callbacks included.
    pub(crate) async fn execute(
        &self,
        request: NativeRequest,
        target: CallTarget,
        session: Option<SessionId>,
        callbacks: CallbackSet,
    ) -> PoolResult<NativeResponse> {
        let operation = request.operation();
        if !self.supports(&request) {
            return Err(PoolError::Unsupported {
                operation,
                backend: self.kind,
            });
        }

        let in_flight = InFlight::enter(&self.in_flight);
        let guard = Arc::clone(&self.backend).lock_owned().await;

        if !self.is_healthy() {
            return Err(match target.generation {
                Some(_) => PoolError::HandleNotFound {
                    kind: target.anchor,
                },
                None => PoolError::NoHealthyWorker,
            });
        }
        let generation = self.generation();
        if target.generation.is_some_and(|g| g != generation) {
            return Err(PoolError::HandleNotFound {
                kind: target.anchor,
            });
        }

        self.set_state(WorkerState::Busy);
        let context = CallContext::new(
            operation,
            self.id,
            generation,
            self.kind,
            session,
            Arc::clone(&self.registry),
            callbacks,
        );
        debug!(
            worker = %self.id,
            call = context.id(),
            operation = %operation,
            "Executing"
        );

        let started = Instant::now();
        let task_context = Arc::clone(&context);
        let mut task = tokio::task::spawn_blocking(move || {
            let mut backend = guard;
            backend.execute(request, &task_context)
        });

        let mut timed_out = false;
        let joined = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(worker = %self.id, operation = %operation, "Call deadline expired");
                    timed_out = true;
                    self.interrupter.lock().interrupt();
                    task.await
                }
            },
            None => task.await,
        };
        context.finish();
        drop(in_flight);

        histogram!("pdfium_pool_execution_seconds", "backend" => self.kind.to_string())
            .record(started.elapsed().as_secs_f64());
        counter!(
            "pdfium_pool_executions_total",
            "backend" => self.kind.to_string(),
            "operation" => operation.to_string()
        )
        .increment(1);
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let outcome = match joined {
            Ok(result) => result,
            Err(e) => Err(PoolError::WorkerCrashed {
                worker: self.id,
                reason: format!("execution task failed: {}", e),
            }),
        };

        let result = match outcome {
            Ok(native) => match context.take_fatal() {
                Some(fatal) => Err(fatal),
                None => native.map_err(|e| PoolError::from_native(operation, self.kind, e)),
            },
            Err(e) => Err(e),
        };

        let result = match result {
            Err(e) if timed_out => {
                debug!(worker = %self.id, error = %e, "Interrupted call returned");
                Err(PoolError::Timeout {
                    operation,
                    after_ms: self.call_timeout.map_or(0, |d| d.as_millis() as u64),
                })
            }
            Ok(_) if timed_out => Err(PoolError::Timeout {
                operation,
                after_ms: self.call_timeout.map_or(0, |d| d.as_millis() as u64),
            }),
            other => other,
        };

        match &result {
            Err(e) if e.is_worker_fatal() => {
                self.counters.crashes.fetch_add(1, Ordering::Relaxed);
                self.set_state(WorkerState::Crashed);
                error!(worker = %self.id, error = %e, "Worker failed");
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.set_state(WorkerState::Ready);
            }
            Ok(_) => self.set_state(WorkerState::Ready),
        }
        result
    }

    /// Mark the worker crashed, move it to a new generation and drop every
    /// handle it owned. Returns the sessions that were force-closed.
    pub(crate) fn invalidate(&self) -> Vec<SessionId> {
        self.set_state(WorkerState::Crashed);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let sessions = self.registry.invalidate_worker(self.id, generation);
        self.sessions.store(0, Ordering::Release);
        warn!(
            worker = %self.id,
            generation,
            sessions = sessions.len(),
            "Worker invalidated"
        );
        sessions
    }

    /// Replace the backend with a fresh one while holding the execution lock.
    pub(crate) async fn respawn(&self, backoff: Duration) -> PoolResult<()> {
        let mut backend = self.backend.lock().await;
        self.set_state(WorkerState::Restarting);
        backend.shutdown();
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        let restarts = self.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        match spawn_backend(&self.factory, self.id).await {
            Ok(fresh) => {
                *self.interrupter.lock() = fresh.interrupter();
                *self.pid.lock() = fresh.pid();
                *backend = fresh;
                self.set_state(WorkerState::Ready);
                counter!("pdfium_pool_restarts_total", "backend" => self.kind.to_string())
                    .increment(1);
                info!(worker = %self.id, restarts, generation = self.generation(), "Worker restarted");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Crashed);
                error!(worker = %self.id, error = %e, "Worker restart failed");
                Err(e)
            }
        }
    }

    /// Ask the backend whether it is still alive.
    pub(crate) async fn check_alive(&self) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let healthy = self.backend.lock().await.is_healthy();
        if !healthy {
            self.set_state(WorkerState::Crashed);
        }
        healthy
    }

    pub(crate) async fn shutdown(&self) {
        let mut backend = self.backend.lock().await;
        backend.shutdown();
        self.set_state(WorkerState::Stopped);
        info!(worker = %self.id, "Worker stopped");
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            backend: self.kind,
            state: self.state(),
            generation: self.generation(),
            pid: *self.pid.lock(),
            sessions: self.sessions(),
            in_flight: self.in_flight(),
            executions: self.counters.executions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            crashes: self.counters.crashes.load(Ordering::Relaxed),
            restarts: self.restarts(),
        }
    }
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn spawn_backend(factory: &BackendFactory, id: WorkerId) -> PoolResult<Box<dyn Backend>> {
    let factory = Arc::clone(factory);
    tokio::task::spawn_blocking(move || factory(id))
        .await
        .map_err(|e| PoolError::Internal {
            message: format!("backend start task failed: {}", e),
        })?
}

/// Settings for the child process of a sub-process worker.
pub(crate) fn worker_environment(worker: WorkerId, settings: &LibrarySettings) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "PDFIUM_POOL__LIBRARY__KIND".to_string(),
            settings.kind.to_string(),
        ),
        ("PDFIUM_POOL_WORKER_ID".to_string(), worker.index().to_string()),
    ];
    if let Some(path) = &settings.path {
        env.push((
            "PDFIUM_POOL__LIBRARY__PATH".to_string(),
            path.to_string_lossy().into_owned(),
        ));
    }
    env
}
