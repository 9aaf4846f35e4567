//! Handle registry.
//!
//! Maps opaque [`Handle`]s to the native values a worker's library issued,
//! scoped to the worker, the worker's generation, and the session (loaded
//! document) the object derives from.
//!
//! Lock order: a DashMap guard is never held while a session mutex is taken.
//! Entries are copied out of the maps before any session state is touched.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PoolError, PoolResult};
use crate::handle::{Handle, HandleKind, SessionId, WorkerId};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Document loaded, no operation issued yet
    Created,
    Active,
    Closing,
    Closed,
}

impl SessionPhase {
    fn is_open(&self) -> bool {
        matches!(self, SessionPhase::Created | SessionPhase::Active)
    }
}

/// A handle resolved back to where its native object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub native: u64,
    pub worker: WorkerId,
    pub generation: u64,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    kind: HandleKind,
    native: u64,
    worker: WorkerId,
    generation: u64,
    session: Option<SessionId>,
}

impl HandleEntry {
    fn resolved(&self) -> Resolved {
        Resolved {
            native: self.native,
            worker: self.worker,
            generation: self.generation,
            session: self.session,
        }
    }
}

type NativeKey = (WorkerId, u64, HandleKind, u64);

struct SessionState {
    phase: SessionPhase,
    handles: HashSet<Uuid>,
    document: Option<Handle>,
}

struct SessionEntry {
    worker: WorkerId,
    generation: u64,
    state: Mutex<SessionState>,
}

/// Registry shared by every worker of a pool.
pub struct HandleRegistry {
    handles: DashMap<Uuid, HandleEntry>,
    natives: DashMap<NativeKey, Uuid>,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    worker_generations: DashMap<WorkerId, u64>,
    closed_documents: Mutex<LruCache<Uuid, ()>>,
}

impl HandleRegistry {
    pub fn new(closed_document_memory: usize) -> Self {
        let capacity = NonZeroUsize::new(closed_document_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            handles: DashMap::new(),
            natives: DashMap::new(),
            sessions: DashMap::new(),
            worker_generations: DashMap::new(),
            closed_documents: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Current generation of `worker`; unknown workers are at generation 0.
    pub fn generation(&self, worker: WorkerId) -> u64 {
        self.worker_generations
            .get(&worker)
            .map(|g| *g)
            .unwrap_or_default()
    }

    fn is_current(&self, worker: WorkerId, generation: u64) -> bool {
        self.generation(worker) == generation
    }

    fn session(&self, session: SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(&session).map(|s| Arc::clone(s.value()))
    }

    /// Start a session bound to `worker`.
    pub fn open_session(&self, worker: WorkerId, generation: u64) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(
            id,
            Arc::new(SessionEntry {
                worker,
                generation,
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Created,
                    handles: HashSet::new(),
                    document: None,
                }),
            }),
        );
        debug!(session = %id, worker = %worker, generation, "Opened session");
        id
    }

    pub fn session_phase(&self, session: SessionId) -> Option<SessionPhase> {
        self.session(session).map(|s| s.state.lock().phase)
    }

    pub fn session_worker(&self, session: SessionId) -> Option<(WorkerId, u64)> {
        self.session(session).map(|s| (s.worker, s.generation))
    }

    /// Document handle a session was created for.
    pub fn session_document(&self, session: SessionId) -> Option<Handle> {
        self.session(session).and_then(|s| s.state.lock().document)
    }

    /// Register a native value and return its handle.
    ///
    /// A native value already registered on the same worker generation keeps
    /// its existing handle.
    pub fn register(
        &self,
        worker: WorkerId,
        generation: u64,
        session: Option<SessionId>,
        native: u64,
        kind: HandleKind,
    ) -> PoolResult<Handle> {
        if !self.is_current(worker, generation) {
            return Err(PoolError::HandleNotFound { kind });
        }

        let key = (worker, generation, kind, native);
        if let Some(existing) = self.natives.get(&key).map(|id| *id) {
            return Ok(Handle::from_parts(existing, kind));
        }

        let handle = Handle::new(kind);
        let entry = HandleEntry {
            kind,
            native,
            worker,
            generation,
            session,
        };

        match session {
            Some(session_id) => {
                let session_entry = self
                    .session(session_id)
                    .ok_or(PoolError::HandleNotFound {
                        kind: HandleKind::Document,
                    })?;
                if session_entry.worker != worker || session_entry.generation != generation {
                    return Err(PoolError::HandleNotFound {
                        kind: HandleKind::Document,
                    });
                }
                let mut state = session_entry.state.lock();
                if !state.phase.is_open() {
                    return Err(PoolError::HandleNotFound {
                        kind: HandleKind::Document,
                    });
                }
                state.handles.insert(handle.id());
                if kind == HandleKind::Document && state.document.is_none() {
                    state.document = Some(handle);
                }
                // Inserted under the session lock so a concurrent close
                // cannot miss this handle
                self.handles.insert(handle.id(), entry);
                self.natives.insert(key, handle.id());
            }
            None => {
                self.handles.insert(handle.id(), entry);
                self.natives.insert(key, handle.id());
            }
        }

        Ok(handle)
    }

    /// Resolve `handle` for use by a new operation.
    ///
    /// Fails with the kind-specific not-found error when the handle is
    /// unknown, has a different kind, lives on another worker or an older
    /// generation of it, or its session is no longer open.
    pub fn resolve(
        &self,
        handle: Handle,
        expected: HandleKind,
        required_worker: Option<WorkerId>,
    ) -> PoolResult<Resolved> {
        let not_found = PoolError::HandleNotFound { kind: expected };

        let entry = match self.handles.get(&handle.id()) {
            Some(entry) => *entry,
            None => return Err(not_found),
        };

        if entry.kind != expected || handle.kind() != expected {
            return Err(not_found);
        }
        if required_worker.is_some_and(|w| w != entry.worker) {
            return Err(not_found);
        }
        if !self.is_current(entry.worker, entry.generation) {
            return Err(not_found);
        }

        if let Some(session_id) = entry.session {
            let session = self.session(session_id).ok_or(not_found.clone())?;
            let mut state = session.state.lock();
            match state.phase {
                SessionPhase::Created => state.phase = SessionPhase::Active,
                SessionPhase::Active => {}
                SessionPhase::Closing | SessionPhase::Closed => return Err(not_found),
            }
        }

        Ok(entry.resolved())
    }

    /// Resolve a document handle that is about to be closed.
    ///
    /// A document closed earlier is reported as already closed rather than
    /// as unknown.
    pub fn resolve_document_for_close(&self, handle: Handle) -> PoolResult<Resolved> {
        let entry = self.handles.get(&handle.id()).map(|e| *e);
        let entry = match entry {
            Some(entry) if entry.kind == HandleKind::Document => entry,
            Some(_) => {
                return Err(PoolError::HandleNotFound {
                    kind: HandleKind::Document,
                });
            }
            None => {
                if self.closed_documents.lock().get(&handle.id()).is_some() {
                    return Err(PoolError::AlreadyClosed {
                        kind: HandleKind::Document,
                    });
                }
                return Err(PoolError::HandleNotFound {
                    kind: HandleKind::Document,
                });
            }
        };

        if !self.is_current(entry.worker, entry.generation) {
            return Err(PoolError::HandleNotFound {
                kind: HandleKind::Document,
            });
        }
        if let Some(session_id) = entry.session {
            match self.session_phase(session_id) {
                Some(phase) if phase.is_open() => {}
                _ => {
                    return Err(PoolError::AlreadyClosed {
                        kind: HandleKind::Document,
                    });
                }
            }
        }

        Ok(entry.resolved())
    }

    /// Native value behind `handle` on the given worker generation, for
    /// translating handles returned from callbacks.
    pub fn native_for(
        &self,
        handle: Handle,
        worker: WorkerId,
        generation: u64,
    ) -> PoolResult<u64> {
        let not_found = PoolError::HandleNotFound {
            kind: handle.kind(),
        };
        let entry = self.handles.get(&handle.id()).map(|e| *e).ok_or(not_found.clone())?;
        if entry.worker != worker || entry.generation != generation || entry.kind != handle.kind()
        {
            return Err(not_found);
        }
        Ok(entry.native)
    }

    /// Existing handle for a native value, used when the library passes a
    /// native value to a callback.
    pub fn handle_for_native(
        &self,
        worker: WorkerId,
        generation: u64,
        kind: HandleKind,
        native: u64,
    ) -> Option<Handle> {
        self.natives
            .get(&(worker, generation, kind, native))
            .map(|id| Handle::from_parts(*id, kind))
    }

    /// Forget one handle. Returns where it lived, if it was registered.
    pub fn invalidate(&self, handle: Handle) -> Option<Resolved> {
        let (_, entry) = self.handles.remove(&handle.id())?;
        self.natives
            .remove(&(entry.worker, entry.generation, entry.kind, entry.native));
        if let Some(session) = entry.session.and_then(|s| self.session(s)) {
            session.state.lock().handles.remove(&handle.id());
        }
        Some(entry.resolved())
    }

    /// Mark a session as closing. A second close fails with
    /// `document was already closed`.
    pub fn begin_close_session(&self, session: SessionId) -> PoolResult<()> {
        let already_closed = PoolError::AlreadyClosed {
            kind: HandleKind::Document,
        };
        let entry = self.session(session).ok_or(already_closed.clone())?;
        let mut state = entry.state.lock();
        if !state.phase.is_open() {
            return Err(already_closed);
        }
        state.phase = SessionPhase::Closing;
        Ok(())
    }

    /// Invalidate every handle the session owns.
    pub fn invalidate_session(&self, session: SessionId) -> usize {
        let Some(entry) = self.session(session) else {
            return 0;
        };

        let (ids, document) = {
            let mut state = entry.state.lock();
            if state.phase.is_open() {
                state.phase = SessionPhase::Closing;
            }
            let ids: Vec<Uuid> = state.handles.drain().collect();
            (ids, state.document)
        };

        for id in &ids {
            if let Some((_, handle)) = self.handles.remove(id) {
                self.natives
                    .remove(&(handle.worker, handle.generation, handle.kind, handle.native));
            }
        }
        if let Some(document) = document {
            self.closed_documents.lock().put(document.id(), ());
        }

        debug!(session = %session, handles = ids.len(), "Invalidated session");
        ids.len()
    }

    /// Mark a session closed and drop its bookkeeping.
    pub fn finish_close_session(&self, session: SessionId) {
        if let Some((_, entry)) = self.sessions.remove(&session) {
            entry.state.lock().phase = SessionPhase::Closed;
        }
    }

    /// Drop everything that lived on `worker` and move it to
    /// `new_generation`. Returns the sessions that were force-closed.
    pub fn invalidate_worker(&self, worker: WorkerId, new_generation: u64) -> Vec<SessionId> {
        self.worker_generations.insert(worker, new_generation);

        let sessions: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().worker == worker)
            .map(|entry| *entry.key())
            .collect();
        for session in &sessions {
            self.invalidate_session(*session);
            self.finish_close_session(*session);
        }

        // Session-less handles (bitmaps) on that worker
        let orphans: Vec<Uuid> = self
            .handles
            .iter()
            .filter(|entry| entry.value().worker == worker)
            .map(|entry| *entry.key())
            .collect();
        for id in &orphans {
            self.handles.remove(id);
        }
        self.natives.retain(|key, _| key.0 != worker);

        debug!(
            worker = %worker,
            generation = new_generation,
            sessions = sessions.len(),
            "Invalidated worker"
        );
        sessions
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.handles.contains_key(&handle.id())
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
