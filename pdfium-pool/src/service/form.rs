//! Form-fill environments.
//!
//! The callbacks given to `init_form_fill_environment` stay attached to the
//! form handle: every later call on that form (including the exit, which
//! kills pending timers) raises them.

use tracing::debug;

use crate::bridge::CallbackSet;
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, OperationKind};
use crate::requests::{ExitFormFillEnvironment, FormOnAfterLoadPage, InitFormFillEnvironment};
use crate::responses::FormResponse;

use super::{FormRegistration, PdfiumService, created, done};

impl PdfiumService {
    pub async fn init_form_fill_environment(
        &self,
        request: InitFormFillEnvironment,
    ) -> PoolResult<FormResponse> {
        let registered = request.callbacks.validate()?;
        let (document, target) = self.resolve(request.document, HandleKind::Document, None)?;

        let response = self
            .run(
                &target,
                NativeRequest::InitFormFillEnvironment {
                    document,
                    callbacks: registered,
                },
                CallbackSet::with_form(request.callbacks.clone()),
            )
            .await?;
        let native = created(OperationKind::InitFormFillEnvironment, response)?;

        let form = self
            .adopt_with(
                &target,
                native,
                HandleKind::FormHandle,
                NativeRequest::ExitFormFillEnvironment { form: native },
                CallbackSet::with_form(request.callbacks.clone()),
            )
            .await?;

        self.forms.insert(
            form.id(),
            FormRegistration {
                form,
                callbacks: request.callbacks,
                session: target.session,
            },
        );
        debug!(form = %form, worker = %target.worker, "Form environment created");
        Ok(FormResponse { form })
    }

    pub async fn exit_form_fill_environment(
        &self,
        request: ExitFormFillEnvironment,
    ) -> PoolResult<()> {
        let (form, target) = self.resolve(request.form, HandleKind::FormHandle, None)?;
        let callbacks = self.form_callbacks(request.form)?;
        self.pool.registry().invalidate(request.form);
        self.forms.remove(&request.form.id());

        let response = self
            .run(
                &target,
                NativeRequest::ExitFormFillEnvironment { form },
                CallbackSet::with_form(callbacks),
            )
            .await?;
        done(OperationKind::ExitFormFillEnvironment, response)
    }

    pub async fn form_on_after_load_page(&self, request: FormOnAfterLoadPage) -> PoolResult<()> {
        let (form, target) = self.resolve(request.form, HandleKind::FormHandle, None)?;
        let (page, _) = self.resolve_page(&request.page, Some(&target))?;
        let callbacks = self.form_callbacks(request.form)?;

        let response = self
            .run(
                &target,
                NativeRequest::FormOnAfterLoadPage { form, page },
                CallbackSet::with_form(callbacks),
            )
            .await?;
        done(OperationKind::FormOnAfterLoadPage, response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::bridge::FormFillCallbacks;
    use crate::error::PoolError;
    use crate::handle::{Handle, HandleKind};
    use crate::protocol::LocalTime;
    use crate::requests::*;
    use crate::service::tests::{load, memory_service};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Every required callback, each appending its name to `log`.
    fn recording_callbacks(log: &Log) -> FormFillCallbacks {
        let push = |log: &Log, name: &'static str| {
            let log = Arc::clone(log);
            move || log.lock().push(name.to_string())
        };
        let invalidate = push(log, "invalidate");
        let set_cursor = push(log, "set_cursor");
        let set_timer = push(log, "set_timer");
        let kill_timer = push(log, "kill_timer");
        let local_time = push(log, "local_time");
        let get_page = push(log, "get_page");
        let current_page = push(log, "current_page");
        let rotation = push(log, "rotation");
        let named_action = push(log, "named_action");

        FormFillCallbacks::new()
            .on_invalidate(move |_, _, _| invalidate())
            .on_set_cursor(move |_, _| set_cursor())
            .on_set_timer(move |_, _| {
                set_timer();
                7
            })
            .on_kill_timer(move |_, timer| {
                assert_eq!(timer, 7);
                kill_timer()
            })
            .on_get_local_time(move |_| {
                local_time();
                LocalTime::default()
            })
            .on_get_page(move |_, _, _| {
                get_page();
                Ok(None)
            })
            .on_get_current_page(move |_, _| {
                current_page();
                Ok(None)
            })
            .on_get_rotation(move |_, _| {
                rotation();
                0
            })
            .on_execute_named_action(move |_, _| named_action())
    }

    #[tokio::test]
    async fn test_missing_callback_is_rejected_before_any_call() {
        let service = memory_service(1).await;
        let document = load(&service, &["form"]).await;

        let callbacks = FormFillCallbacks::new()
            .on_invalidate(|_, _, _| {})
            .on_set_cursor(|_, _| {});
        let err = service
            .init_form_fill_environment(InitFormFillEnvironment {
                document,
                callbacks,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "callback FFI_SetTimer is required");
        assert!(err.is_argument_error());
        assert_eq!(service.pool().stats().workers[0].executions, 1);
    }

    #[tokio::test]
    async fn test_callbacks_follow_the_form() {
        let service = memory_service(1).await;
        let document = load(&service, &["form"]).await;
        let log: Log = Arc::default();

        let changes = Arc::new(Mutex::new(0));
        let callbacks = {
            let changes = Arc::clone(&changes);
            recording_callbacks(&log).on_change(move |_| *changes.lock() += 1)
        };
        let form = service
            .init_form_fill_environment(InitFormFillEnvironment {
                document,
                callbacks,
            })
            .await
            .unwrap()
            .form;
        assert_eq!(form.kind(), HandleKind::FormHandle);

        service
            .form_on_after_load_page(FormOnAfterLoadPage {
                form,
                page: Page::index(document, 0),
            })
            .await
            .unwrap();
        service
            .exit_form_fill_environment(ExitFormFillEnvironment { form })
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["current_page", "invalidate", "set_timer", "kill_timer"]
        );
        assert_eq!(*changes.lock(), 1);

        assert_eq!(
            service
                .exit_form_fill_environment(ExitFormFillEnvironment { form })
                .await
                .unwrap_err(),
            PoolError::HandleNotFound {
                kind: HandleKind::FormHandle
            }
        );
    }

    #[tokio::test]
    async fn test_callback_loads_a_page_on_the_same_worker() {
        let service = memory_service(2).await;
        let document = load(&service, &["one", "two"]).await;
        let loaded: Arc<Mutex<Option<Handle>>> = Arc::default();

        let log: Log = Arc::default();
        let callbacks = {
            let loaded = Arc::clone(&loaded);
            recording_callbacks(&log).on_get_current_page(move |scope, document| {
                assert_eq!(scope.get_page_count(document)?, 2);
                let page = scope.load_page(document, 1)?;
                *loaded.lock() = Some(page);
                Ok(Some(page))
            })
        };
        let form = service
            .init_form_fill_environment(InitFormFillEnvironment {
                document,
                callbacks,
            })
            .await
            .unwrap()
            .form;
        service
            .form_on_after_load_page(FormOnAfterLoadPage {
                form,
                page: Page::index(document, 0),
            })
            .await
            .unwrap();

        let page = loaded.lock().take().unwrap();
        let size = service
            .get_page_size(GetPageSize {
                page: Page::reference(page),
            })
            .await
            .unwrap();
        assert_eq!(size.height, 792.0);

        // The page belongs to the document's session and closes with it
        service
            .close_document(CloseDocument { document })
            .await
            .unwrap();
        assert_eq!(
            service.close_page(ClosePage { page }).await.unwrap_err(),
            PoolError::HandleNotFound {
                kind: HandleKind::Page
            }
        );
        assert_eq!(
            service
                .form_on_after_load_page(FormOnAfterLoadPage {
                    form,
                    page: Page::reference(page),
                })
                .await
                .unwrap_err(),
            PoolError::HandleNotFound {
                kind: HandleKind::FormHandle
            }
        );
    }
}
