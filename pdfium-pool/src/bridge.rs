//! Callback bridge, host side.
//!
//! Callers register plain Rust closures. While a call is in flight the worker
//! raises [`CallbackRequest`]s carrying native values; the [`CallContext`] of
//! that call translates them to handles, runs the caller's closure, and
//! translates the reply back. A closure may issue nested operations through
//! its [`CallbackScope`]; those run on the worker that is already executing
//! the outer call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::BackendKind;
use crate::error::{PoolError, PoolResult};
use crate::handle::{Handle, HandleKind, SessionId, WorkerId};
use crate::native::NativeResult;
use crate::protocol::{
    CallbackReply, CallbackRequest, FormCallbackKind, LocalTime, NativeRequest, NativeResponse,
    OperationKind,
};
use crate::registry::HandleRegistry;

/// Nested operations a callback may start before it returns.
const MAX_CALL_DEPTH: usize = 8;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Progressive render pause check: return `true` to pause.
pub type PauseCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Rectangle reported to `FFI_Invalidate`, in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

type InvalidateFn = Arc<dyn Fn(&mut CallbackScope<'_>, Handle, FormRect) + Send + Sync>;
type SetCursorFn = Arc<dyn Fn(&mut CallbackScope<'_>, i32) + Send + Sync>;
type SetTimerFn = Arc<dyn Fn(&mut CallbackScope<'_>, i32) -> i32 + Send + Sync>;
type KillTimerFn = Arc<dyn Fn(&mut CallbackScope<'_>, i32) + Send + Sync>;
type LocalTimeFn = Arc<dyn Fn(&mut CallbackScope<'_>) -> LocalTime + Send + Sync>;
type GetPageFn =
    Arc<dyn Fn(&mut CallbackScope<'_>, Handle, i32) -> PoolResult<Option<Handle>> + Send + Sync>;
type CurrentPageFn =
    Arc<dyn Fn(&mut CallbackScope<'_>, Handle) -> PoolResult<Option<Handle>> + Send + Sync>;
type RotationFn = Arc<dyn Fn(&mut CallbackScope<'_>, Handle) -> i32 + Send + Sync>;
type NamedActionFn = Arc<dyn Fn(&mut CallbackScope<'_>, &str) + Send + Sync>;
type OnChangeFn = Arc<dyn Fn(&mut CallbackScope<'_>) + Send + Sync>;

/// Form-fill callbacks (`FPDF_FORMFILLINFO`).
///
/// Everything except [`on_change`](Self::on_change) is required by
/// `init_form_fill_environment`.
#[derive(Clone, Default)]
pub struct FormFillCallbacks {
    invalidate: Option<InvalidateFn>,
    set_cursor: Option<SetCursorFn>,
    set_timer: Option<SetTimerFn>,
    kill_timer: Option<KillTimerFn>,
    get_local_time: Option<LocalTimeFn>,
    get_page: Option<GetPageFn>,
    get_current_page: Option<CurrentPageFn>,
    get_rotation: Option<RotationFn>,
    execute_named_action: Option<NamedActionFn>,
    on_change: Option<OnChangeFn>,
}

impl fmt::Debug for FormFillCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormFillCallbacks")
            .field("registered", &self.registered())
            .finish()
    }
}

impl FormFillCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_invalidate<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, Handle, FormRect) + Send + Sync + 'static,
    {
        self.invalidate = Some(Arc::new(f));
        self
    }

    pub fn on_set_cursor<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, i32) + Send + Sync + 'static,
    {
        self.set_cursor = Some(Arc::new(f));
        self
    }

    pub fn on_set_timer<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, i32) -> i32 + Send + Sync + 'static,
    {
        self.set_timer = Some(Arc::new(f));
        self
    }

    pub fn on_kill_timer<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, i32) + Send + Sync + 'static,
    {
        self.kill_timer = Some(Arc::new(f));
        self
    }

    pub fn on_get_local_time<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>) -> LocalTime + Send + Sync + 'static,
    {
        self.get_local_time = Some(Arc::new(f));
        self
    }

    pub fn on_get_page<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, Handle, i32) -> PoolResult<Option<Handle>>
            + Send
            + Sync
            + 'static,
    {
        self.get_page = Some(Arc::new(f));
        self
    }

    pub fn on_get_current_page<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, Handle) -> PoolResult<Option<Handle>> + Send + Sync + 'static,
    {
        self.get_current_page = Some(Arc::new(f));
        self
    }

    pub fn on_get_rotation<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, Handle) -> i32 + Send + Sync + 'static,
    {
        self.get_rotation = Some(Arc::new(f));
        self
    }

    pub fn on_execute_named_action<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>, &str) + Send + Sync + 'static,
    {
        self.execute_named_action = Some(Arc::new(f));
        self
    }

    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackScope<'_>) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    fn has(&self, kind: FormCallbackKind) -> bool {
        match kind {
            FormCallbackKind::Invalidate => self.invalidate.is_some(),
            FormCallbackKind::SetCursor => self.set_cursor.is_some(),
            FormCallbackKind::SetTimer => self.set_timer.is_some(),
            FormCallbackKind::KillTimer => self.kill_timer.is_some(),
            FormCallbackKind::GetLocalTime => self.get_local_time.is_some(),
            FormCallbackKind::GetPage => self.get_page.is_some(),
            FormCallbackKind::GetCurrentPage => self.get_current_page.is_some(),
            FormCallbackKind::GetRotation => self.get_rotation.is_some(),
            FormCallbackKind::ExecuteNamedAction => self.execute_named_action.is_some(),
            FormCallbackKind::OnChange => self.on_change.is_some(),
        }
    }

    fn registered(&self) -> Vec<FormCallbackKind> {
        FormCallbackKind::REQUIRED
            .iter()
            .copied()
            .chain(std::iter::once(FormCallbackKind::OnChange))
            .filter(|kind| self.has(*kind))
            .collect()
    }

    /// Check the required callbacks in their fixed order and return every
    /// registered one.
    pub fn validate(&self) -> PoolResult<Vec<FormCallbackKind>> {
        if let Some(missing) = FormCallbackKind::REQUIRED
            .iter()
            .find(|kind| !self.has(**kind))
        {
            return Err(PoolError::MissingCallback {
                name: missing.ffi_name(),
            });
        }
        Ok(self.registered())
    }
}

/// Callbacks available to one call.
#[derive(Clone, Default)]
pub(crate) struct CallbackSet {
    pub(crate) pause: Option<PauseCallback>,
    pub(crate) form: Option<FormFillCallbacks>,
}

impl CallbackSet {
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn with_pause(pause: Option<PauseCallback>) -> Self {
        Self { pause, form: None }
    }

    pub(crate) fn with_form(form: FormFillCallbacks) -> Self {
        Self {
            pause: None,
            form: Some(form),
        }
    }
}

/// Runs operations issued from inside a callback on the worker that raised
/// it, while the outer call is still in flight.
pub(crate) trait NestedExecutor {
    fn execute_nested(
        &mut self,
        request: NativeRequest,
        context: &CallContext,
    ) -> PoolResult<NativeResult<NativeResponse>>;
}

/// State of one in-flight call, shared with the worker side while it runs.
pub(crate) struct CallContext {
    id: u64,
    operation: OperationKind,
    worker: WorkerId,
    generation: u64,
    backend: BackendKind,
    session: Option<SessionId>,
    registry: Arc<HandleRegistry>,
    callbacks: CallbackSet,
    live: AtomicBool,
    depth: AtomicUsize,
    fatal: Mutex<Option<PoolError>>,
}

impl CallContext {
    pub(crate) fn new(
        operation: OperationKind,
        worker: WorkerId,
        generation: u64,
        backend: BackendKind,
        session: Option<SessionId>,
        registry: Arc<HandleRegistry>,
        callbacks: CallbackSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            operation,
            worker,
            generation,
            backend,
            session,
            registry,
            callbacks,
            live: AtomicBool::new(true),
            depth: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn worker(&self) -> WorkerId {
        self.worker
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// The call returned; later callbacks are refused.
    pub(crate) fn finish(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Record an error that leaves the worker unusable.
    pub(crate) fn set_fatal(&self, error: PoolError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<PoolError> {
        self.fatal.lock().take()
    }

    /// Serve one callback raised by the worker.
    pub(crate) fn invoke(
        &self,
        request: CallbackRequest,
        nested: &mut dyn NestedExecutor,
    ) -> Result<CallbackReply, String> {
        if !self.is_live() {
            warn!(call = self.id, ?request, "Callback after call returned");
            return Err(PoolError::CallbackExpired.to_string());
        }
        trace!(call = self.id, worker = %self.worker, ?request, "Callback");

        let result = self.dispatch(request, nested);
        if let Err(e) = &result {
            if e.is_worker_fatal() {
                self.set_fatal(e.clone());
            }
            debug!(call = self.id, error = %e, "Callback failed");
        }
        result.map_err(|e| e.to_string())
    }

    fn dispatch(
        &self,
        request: CallbackRequest,
        nested: &mut dyn NestedExecutor,
    ) -> PoolResult<CallbackReply> {
        if let CallbackRequest::NeedToPauseNow = request {
            let pause = self.callbacks.pause.as_ref().is_some_and(|f| f());
            return Ok(CallbackReply::Pause { pause });
        }

        let form = self
            .callbacks
            .form
            .as_ref()
            .ok_or_else(|| PoolError::CallbackFailed {
                message: format!("no form callbacks registered for {}", self.operation),
            })?;
        let mut scope = CallbackScope {
            context: self,
            nested,
        };

        let reply = match request {
            CallbackRequest::NeedToPauseNow => CallbackReply::Pause { pause: false },
            CallbackRequest::FormInvalidate {
                page,
                left,
                top,
                right,
                bottom,
            } => {
                let page = self.page_handle(page)?;
                if let Some(f) = &form.invalidate {
                    f(
                        &mut scope,
                        page,
                        FormRect {
                            left,
                            top,
                            right,
                            bottom,
                        },
                    );
                }
                CallbackReply::Unit
            }
            CallbackRequest::FormSetCursor { cursor } => {
                if let Some(f) = &form.set_cursor {
                    f(&mut scope, cursor);
                }
                CallbackReply::Unit
            }
            CallbackRequest::FormSetTimer { elapse_ms } => {
                let timer_id = form.set_timer.as_ref().map_or(0, |f| f(&mut scope, elapse_ms));
                CallbackReply::TimerId { timer_id }
            }
            CallbackRequest::FormKillTimer { timer_id } => {
                if let Some(f) = &form.kill_timer {
                    f(&mut scope, timer_id);
                }
                CallbackReply::Unit
            }
            CallbackRequest::FormGetLocalTime => {
                let time = form
                    .get_local_time
                    .as_ref()
                    .map(|f| f(&mut scope))
                    .unwrap_or_default();
                CallbackReply::LocalTime { time }
            }
            CallbackRequest::FormGetPage { document, index } => {
                let document = self.document_handle(document)?;
                let page = match &form.get_page {
                    Some(f) => f(&mut scope, document, index)?,
                    None => None,
                };
                CallbackReply::Page {
                    page: self.native_page(page)?,
                }
            }
            CallbackRequest::FormGetCurrentPage { document } => {
                let document = self.document_handle(document)?;
                let page = match &form.get_current_page {
                    Some(f) => f(&mut scope, document)?,
                    None => None,
                };
                CallbackReply::Page {
                    page: self.native_page(page)?,
                }
            }
            CallbackRequest::FormGetRotation { page } => {
                let page = self.page_handle(page)?;
                let rotation = form.get_rotation.as_ref().map_or(0, |f| f(&mut scope, page));
                CallbackReply::Rotation { rotation }
            }
            CallbackRequest::FormExecuteNamedAction { name } => {
                if let Some(f) = &form.execute_named_action {
                    f(&mut scope, &name);
                }
                CallbackReply::Unit
            }
            CallbackRequest::FormOnChange => {
                if let Some(f) = &form.on_change {
                    f(&mut scope);
                }
                CallbackReply::Unit
            }
        };
        Ok(reply)
    }

    /// Handle for a page the library passed to a callback. Pages the
    /// caller never saw are registered in the call's session.
    fn page_handle(&self, native: u64) -> PoolResult<Handle> {
        if let Some(handle) =
            self.registry
                .handle_for_native(self.worker, self.generation, HandleKind::Page, native)
        {
            return Ok(handle);
        }
        self.registry.register(
            self.worker,
            self.generation,
            self.session,
            native,
            HandleKind::Page,
        )
    }

    fn document_handle(&self, native: u64) -> PoolResult<Handle> {
        self.registry
            .handle_for_native(self.worker, self.generation, HandleKind::Document, native)
            .ok_or(PoolError::HandleNotFound {
                kind: HandleKind::Document,
            })
    }

    fn native_page(&self, page: Option<Handle>) -> PoolResult<Option<u64>> {
        page.map(|page| {
            if page.kind() != HandleKind::Page {
                return Err(PoolError::HandleNotFound {
                    kind: HandleKind::Page,
                });
            }
            self.registry.native_for(page, self.worker, self.generation)
        })
        .transpose()
    }
}

/// What a callback closure can do while it runs.
pub struct CallbackScope<'a> {
    context: &'a CallContext,
    nested: &'a mut dyn NestedExecutor,
}

impl CallbackScope<'_> {
    pub fn worker(&self) -> WorkerId {
        self.context.worker
    }

    pub fn session(&self) -> Option<SessionId> {
        self.context.session
    }

    fn run(&mut self, request: NativeRequest) -> PoolResult<NativeResponse> {
        let operation = request.operation();
        let depth = self.context.depth.fetch_add(1, Ordering::AcqRel);
        if depth >= MAX_CALL_DEPTH {
            self.context.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Internal {
                message: format!("callback nesting deeper than {}", MAX_CALL_DEPTH),
            });
        }
        let result = self.nested.execute_nested(request, self.context);
        self.context.depth.fetch_sub(1, Ordering::AcqRel);

        result?.map_err(|e| PoolError::from_native(operation, self.context.backend, e))
    }

    fn resolve(&self, handle: Handle, kind: HandleKind) -> PoolResult<u64> {
        Ok(self
            .context
            .registry
            .resolve(handle, kind, Some(self.context.worker))?
            .native)
    }

    /// Load a page of a document on this worker.
    pub fn load_page(&mut self, document: Handle, index: i32) -> PoolResult<Handle> {
        let document = self.resolve(document, HandleKind::Document)?;
        match self.run(NativeRequest::LoadPage { document, index })? {
            NativeResponse::Page { page } => self.context.registry.register(
                self.context.worker,
                self.context.generation,
                self.context.session,
                page,
                HandleKind::Page,
            ),
            other => Err(unexpected(OperationKind::LoadPage, &other)),
        }
    }

    pub fn close_page(&mut self, page: Handle) -> PoolResult<()> {
        let native = self.resolve(page, HandleKind::Page)?;
        self.context.registry.invalidate(page);
        self.run(NativeRequest::ClosePage { page: native })?;
        Ok(())
    }

    pub fn get_page_count(&mut self, document: Handle) -> PoolResult<i32> {
        let document = self.resolve(document, HandleKind::Document)?;
        match self.run(NativeRequest::GetPageCount { document })? {
            NativeResponse::Count { count } => Ok(count),
            other => Err(unexpected(OperationKind::GetPageCount, &other)),
        }
    }
}

pub(crate) fn unexpected(operation: OperationKind, response: &NativeResponse) -> PoolError {
    PoolError::Internal {
        message: format!(
            "unexpected {} response to {}",
            response.name(),
            operation
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NativeError;

    fn full_callbacks() -> FormFillCallbacks {
        FormFillCallbacks::new()
            .on_invalidate(|_, _, _| {})
            .on_set_cursor(|_, _| {})
            .on_set_timer(|_, _| 1)
            .on_kill_timer(|_, _| {})
            .on_get_local_time(|_| LocalTime::default())
            .on_get_page(|_, _, _| Ok(None))
            .on_get_current_page(|_, _| Ok(None))
            .on_get_rotation(|_, _| 0)
            .on_execute_named_action(|_, _| {})
    }

    /// Counts nested calls and answers page loads with a fixed native.
    struct FixedNested {
        calls: usize,
    }

    impl NestedExecutor for FixedNested {
        fn execute_nested(
            &mut self,
            request: NativeRequest,
            _context: &CallContext,
        ) -> PoolResult<NativeResult<NativeResponse>> {
            self.calls += 1;
            Ok(match request {
                NativeRequest::LoadPage { .. } => Ok(NativeResponse::Page { page: 0x9000 }),
                NativeRequest::GetPageCount { .. } => Ok(NativeResponse::Count { count: 4 }),
                other => Err(NativeError::Unsupported {
                    operation: other.operation(),
                }),
            })
        }
    }

    #[test]
    fn test_required_callbacks_checked_in_order() {
        assert_eq!(
            FormFillCallbacks::new().validate(),
            Err(PoolError::MissingCallback {
                name: "FFI_Invalidate"
            })
        );

        let partial = FormFillCallbacks::new()
            .on_invalidate(|_, _, _| {})
            .on_set_cursor(|_, _| {})
            .on_set_timer(|_, _| 1)
            .on_kill_timer(|_, _| {})
            .on_get_local_time(|_| LocalTime::default())
            .on_get_current_page(|_, _| Ok(None));
        assert_eq!(
            partial.validate().unwrap_err().to_string(),
            "callback FFI_GetPage is required"
        );

        let registered = full_callbacks().validate().unwrap();
        assert_eq!(registered, FormCallbackKind::REQUIRED.to_vec());

        let registered = full_callbacks().on_change(|_| {}).validate().unwrap();
        assert_eq!(registered.last(), Some(&FormCallbackKind::OnChange));
    }

    #[test]
    fn test_callbacks_refused_after_call_returned() {
        let registry = Arc::new(HandleRegistry::new(4));
        let context = CallContext::new(
            OperationKind::RenderPageBitmapStart,
            WorkerId::new(0),
            0,
            BackendKind::InProcess,
            None,
            registry,
            CallbackSet::with_pause(Some(Arc::new(|| true))),
        );
        let mut nested = FixedNested { calls: 0 };

        assert_eq!(
            context.invoke(CallbackRequest::NeedToPauseNow, &mut nested),
            Ok(CallbackReply::Pause { pause: true })
        );
        context.finish();
        assert_eq!(
            context.invoke(CallbackRequest::NeedToPauseNow, &mut nested),
            Err("callback invoked after its call returned".to_string())
        );
    }

    #[test]
    fn test_nested_load_from_callback() {
        let registry = Arc::new(HandleRegistry::new(4));
        let worker = WorkerId::new(0);
        let session = registry.open_session(worker, 0);
        registry
            .register(worker, 0, Some(session), 0x1000, HandleKind::Document)
            .unwrap();

        let callbacks = full_callbacks().on_get_current_page(|scope, document| {
            assert_eq!(scope.get_page_count(document)?, 4);
            scope.load_page(document, 2).map(Some)
        });
        let context = CallContext::new(
            OperationKind::FormOnAfterLoadPage,
            worker,
            0,
            BackendKind::InProcess,
            Some(session),
            Arc::clone(&registry),
            CallbackSet::with_form(callbacks),
        );
        let mut nested = FixedNested { calls: 0 };

        let reply = context
            .invoke(
                CallbackRequest::FormGetCurrentPage { document: 0x1000 },
                &mut nested,
            )
            .unwrap();
        assert_eq!(reply, CallbackReply::Page { page: Some(0x9000) });
        assert_eq!(nested.calls, 2);
        assert!(
            registry
                .handle_for_native(worker, 0, HandleKind::Page, 0x9000)
                .is_some()
        );
    }

    #[test]
    fn test_unknown_page_is_registered_in_session() {
        let registry = Arc::new(HandleRegistry::new(4));
        let worker = WorkerId::new(1);
        let session = registry.open_session(worker, 0);
        let seen = Arc::new(Mutex::new(None));
        let seen_in_callback = Arc::clone(&seen);

        let callbacks = full_callbacks().on_invalidate(move |_, page, rect| {
            *seen_in_callback.lock() = Some((page, rect.right));
        });
        let context = CallContext::new(
            OperationKind::FormOnAfterLoadPage,
            worker,
            0,
            BackendKind::Subprocess,
            Some(session),
            Arc::clone(&registry),
            CallbackSet::with_form(callbacks),
        );

        context
            .invoke(
                CallbackRequest::FormInvalidate {
                    page: 0x2000,
                    left: 0.0,
                    top: 792.0,
                    right: 612.0,
                    bottom: 0.0,
                },
                &mut FixedNested { calls: 0 },
            )
            .unwrap();

        let (page, right) = seen.lock().take().unwrap();
        assert_eq!(right, 612.0);
        assert_eq!(page.kind(), HandleKind::Page);
        assert_eq!(
            registry.resolve(page, HandleKind::Page, Some(worker)).unwrap().session,
            Some(session)
        );
    }

    #[test]
    fn test_form_callback_without_registration_fails() {
        let registry = Arc::new(HandleRegistry::new(4));
        let context = CallContext::new(
            OperationKind::RenderPageContinue,
            WorkerId::new(0),
            0,
            BackendKind::InProcess,
            None,
            registry,
            CallbackSet::none(),
        );
        assert!(
            context
                .invoke(CallbackRequest::FormOnChange, &mut FixedNested { calls: 0 })
                .is_err()
        );
        // No pause callback means never pause
        assert_eq!(
            context.invoke(CallbackRequest::NeedToPauseNow, &mut FixedNested { calls: 0 }),
            Ok(CallbackReply::Pause { pause: false })
        );
    }
}
