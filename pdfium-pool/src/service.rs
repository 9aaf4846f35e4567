//! Request facade.
//!
//! Every operation resolves its handles through the registry, routes the
//! native request to the worker that owns them, and registers whatever the
//! library created before handing it back.

mod annotation;
mod bitmap;
mod document;
mod form;
mod page;
mod render;
mod system;
mod text;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::{CallbackSet, FormFillCallbacks, unexpected};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::handle::{Handle, HandleKind, SessionId, WorkerId};
use crate::pool::WorkerPool;
use crate::protocol::{NativePage, NativeRequest, NativeResponse, OperationKind};
use crate::registry::Resolved;
use crate::requests::{Page, PageLocator};
use crate::worker::CallTarget;

/// Form-fill callbacks stay attached to their form handle until it exits.
#[derive(Clone)]
struct FormRegistration {
    form: Handle,
    callbacks: FormFillCallbacks,
    session: Option<SessionId>,
}

/// Public entry point: one typed method per operation.
///
/// Clones share the same pool and form registrations.
#[derive(Clone)]
pub struct PdfiumService {
    pool: Arc<WorkerPool>,
    forms: Arc<DashMap<Uuid, FormRegistration>>,
}

/// Where a request runs, taken from the handles it was resolved from.
#[derive(Debug, Clone, Copy)]
struct Target {
    worker: WorkerId,
    generation: u64,
    session: Option<SessionId>,
    anchor: HandleKind,
}

impl Target {
    fn of(resolved: &Resolved, anchor: HandleKind) -> Self {
        Self {
            worker: resolved.worker,
            generation: resolved.generation,
            session: resolved.session,
            anchor,
        }
    }

    fn call(&self) -> CallTarget {
        CallTarget::anchored(self.generation, self.anchor)
    }
}

impl PdfiumService {
    /// Start a pool from `config` and serve requests on it.
    pub async fn start(config: PoolConfig) -> PoolResult<Self> {
        Ok(Self::new(Arc::new(WorkerPool::start(config).await?)))
    }

    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            forms: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Resolve `handle`, optionally insisting that it lives on the worker of
    /// an argument resolved earlier.
    fn resolve(
        &self,
        handle: Handle,
        kind: HandleKind,
        on: Option<&Target>,
    ) -> PoolResult<(u64, Target)> {
        let resolved = self
            .pool
            .registry()
            .resolve(handle, kind, on.map(|t| t.worker))?;
        if let Some(on) = on
            && on.generation != resolved.generation
        {
            return Err(PoolError::HandleNotFound { kind });
        }
        Ok((resolved.native, Target::of(&resolved, kind)))
    }

    fn resolve_page(&self, page: &Page, on: Option<&Target>) -> PoolResult<(NativePage, Target)> {
        match page.locate()? {
            PageLocator::Index(index) => {
                let (document, target) = self.resolve(index.document, HandleKind::Document, on)?;
                Ok((
                    NativePage::Index {
                        document,
                        index: index.index,
                    },
                    target,
                ))
            }
            PageLocator::Reference(handle) => {
                let (page, target) = self.resolve(handle, HandleKind::Page, on)?;
                Ok((NativePage::Reference { page }, target))
            }
        }
    }

    /// Run a request on the target's worker. The call and any crash
    /// recovery it triggers finish even if the caller stops waiting.
    async fn run(
        &self,
        target: &Target,
        request: NativeRequest,
        callbacks: CallbackSet,
    ) -> PoolResult<NativeResponse> {
        let worker = self.pool.worker(target.worker)?;
        let pool = Arc::clone(&self.pool);
        let (call, session) = (target.call(), target.session);
        self.detached(async move {
            pool.execute(&worker, request, call, session, callbacks)
                .await
        })
        .await
    }

    /// Run `task` on its own tokio task and wait for it. Dropping the
    /// returned future leaves the task running to completion.
    async fn detached<T, F>(&self, task: F) -> PoolResult<T>
    where
        F: Future<Output = PoolResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(task).await.map_err(|e| PoolError::Internal {
            message: format!("request task failed: {}", e),
        })?
    }

    /// Register an object the library just created. If that fails (the
    /// session closed or the worker restarted meanwhile) the object is
    /// released again so nothing leaks.
    async fn adopt(
        &self,
        target: &Target,
        native: u64,
        kind: HandleKind,
        release: NativeRequest,
    ) -> PoolResult<Handle> {
        self.adopt_with(target, native, kind, release, CallbackSet::none())
            .await
    }

    /// [`adopt`](Self::adopt) for objects whose release raises callbacks.
    async fn adopt_with(
        &self,
        target: &Target,
        native: u64,
        kind: HandleKind,
        release: NativeRequest,
        callbacks: CallbackSet,
    ) -> PoolResult<Handle> {
        match self.pool.registry().register(
            target.worker,
            target.generation,
            target.session,
            native,
            kind,
        ) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                debug!(worker = %target.worker, kind = %kind, native, "Releasing unregistered object");
                let orphan = Target {
                    session: None,
                    ..*target
                };
                if let Err(release_error) = self.run(&orphan, release, callbacks).await {
                    warn!(kind = %kind, error = %release_error, "Failed to release orphaned object");
                }
                Err(e)
            }
        }
    }

    fn form_callbacks(&self, form: Handle) -> PoolResult<FormFillCallbacks> {
        self.forms
            .get(&form.id())
            .map(|registration| registration.callbacks.clone())
            .ok_or(PoolError::HandleNotFound {
                kind: HandleKind::FormHandle,
            })
    }

    /// Unregister every form of `session`, returning them.
    fn take_forms(&self, session: SessionId) -> Vec<FormRegistration> {
        let ids: Vec<Uuid> = self
            .forms
            .iter()
            .filter(|entry| entry.session == Some(session))
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.forms.remove(&id).map(|(_, registration)| registration))
            .collect()
    }
}

/// Native value of the object a create/load call returned.
fn created(operation: OperationKind, response: NativeResponse) -> PoolResult<u64> {
    match response {
        NativeResponse::Document { document } => Ok(document),
        NativeResponse::Page { page } => Ok(page),
        NativeResponse::TextPage { text_page } => Ok(text_page),
        NativeResponse::Search { search } => Ok(search),
        NativeResponse::Bitmap { bitmap } => Ok(bitmap),
        NativeResponse::Annotation { annotation } => Ok(annotation),
        NativeResponse::Form { form } => Ok(form),
        other => Err(unexpected(operation, &other)),
    }
}

fn count(operation: OperationKind, response: NativeResponse) -> PoolResult<i32> {
    match response {
        NativeResponse::Count { count } => Ok(count),
        other => Err(unexpected(operation, &other)),
    }
}

fn done(operation: OperationKind, response: NativeResponse) -> PoolResult<()> {
    match response {
        NativeResponse::Done => Ok(()),
        other => Err(unexpected(operation, &other)),
    }
}
