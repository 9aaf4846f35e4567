//! Document sessions: load, count pages, close.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bridge::CallbackSet;
use crate::error::{PoolError, PoolResult};
use crate::handle::{HandleKind, SessionId};
use crate::pool::SessionLease;
use crate::protocol::{NativeRequest, OperationKind};
use crate::requests::{
    CloseDocument, GetPageCount, LoadDocument, LoadDocumentFromPath, LoadDocumentFromReader,
};
use crate::responses::{DocumentResponse, PageCountResponse};
use crate::worker::CallTarget;

use super::{PdfiumService, Target, count, created, done};

impl PdfiumService {
    pub async fn load_document(&self, request: LoadDocument) -> PoolResult<DocumentResponse> {
        self.open_session(
            NativeRequest::LoadDocument {
                data: request.data,
                password: request.password,
            },
            request.acquire_timeout,
        )
        .await
    }

    /// Read exactly `size` bytes from the reader, then load them.
    pub async fn load_document_from_reader<R>(
        &self,
        request: LoadDocumentFromReader<R>,
    ) -> PoolResult<DocumentResponse>
    where
        R: AsyncRead + Unpin,
    {
        let capacity = usize::try_from(request.size).map_err(|_| PoolError::InvalidArgument {
            message: format!("document size {} is too large", request.size),
        })?;
        let mut data = Vec::with_capacity(capacity);
        let mut reader = request.reader.take(request.size);
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| PoolError::InvalidArgument {
                message: format!("failed to read document: {}", e),
            })?;
        if data.len() != capacity {
            return Err(PoolError::InvalidArgument {
                message: format!(
                    "reader returned {} bytes, expected {}",
                    data.len(),
                    request.size
                ),
            });
        }

        self.open_session(
            NativeRequest::LoadDocument {
                data,
                password: request.password,
            },
            request.acquire_timeout,
        )
        .await
    }

    pub async fn load_document_from_path(
        &self,
        request: LoadDocumentFromPath,
    ) -> PoolResult<DocumentResponse> {
        self.open_session(
            NativeRequest::LoadDocumentFromPath {
                path: request.path.to_string_lossy().into_owned(),
                password: request.password,
            },
            request.acquire_timeout,
        )
        .await
    }

    /// Every load funnels through here: take a slot, load on the chosen
    /// worker, register the document as the root of a new session.
    ///
    /// The load runs on its own task. A caller that stops waiting for a slot
    /// withdraws its request; one that stops waiting after the slot was taken
    /// gets its document closed again once the load finishes.
    async fn open_session(
        &self,
        request: NativeRequest,
        acquire_timeout: Option<Duration>,
    ) -> PoolResult<DocumentResponse> {
        let operation = request.operation();
        let backend = self.pool.config().backend;
        if !backend.supports(operation) {
            return Err(PoolError::Unsupported { operation, backend });
        }
        let timeout = acquire_timeout.unwrap_or_else(|| self.pool.config().acquire_timeout());

        let (mut tx, rx) = oneshot::channel();
        let service = self.clone();
        tokio::spawn(async move {
            let lease = tokio::select! {
                lease = service.pool.acquire(timeout) => lease,
                _ = tx.closed() => {
                    debug!("Load abandoned while waiting for a slot");
                    return;
                }
            };
            let result = match lease {
                Ok(lease) => service.load_into(lease, request).await,
                Err(e) => Err(e),
            };
            if let Err(Ok(loaded)) = tx.send(result) {
                debug!(document = %loaded.document, "Load abandoned, closing document");
                let close = CloseDocument {
                    document: loaded.document,
                };
                if let Err(e) = service.close_session(close).await {
                    warn!(document = %loaded.document, error = %e, "Failed to close abandoned document");
                }
            }
        });

        rx.await.map_err(|_| PoolError::Internal {
            message: "document load task failed".to_string(),
        })?
    }

    async fn load_into(
        &self,
        lease: SessionLease,
        request: NativeRequest,
    ) -> PoolResult<DocumentResponse> {
        let operation = request.operation();
        let target = Target {
            worker: lease.worker,
            generation: lease.generation,
            session: Some(lease.session),
            anchor: HandleKind::Document,
        };

        let native = match self.run(&target, request, CallbackSet::none()).await {
            Ok(response) => created(operation, response),
            Err(e) => Err(e),
        };
        let native = match native {
            Ok(native) => native,
            Err(e) => {
                debug!(session = %lease.session, error = %e, "Document load failed");
                self.abandon_session(lease.session);
                return Err(e);
            }
        };

        match self
            .adopt(
                &target,
                native,
                HandleKind::Document,
                NativeRequest::CloseDocument { document: native },
            )
            .await
        {
            Ok(document) => {
                info!(
                    document = %document,
                    session = %lease.session,
                    worker = %lease.worker,
                    "Document loaded"
                );
                Ok(DocumentResponse { document })
            }
            Err(e) => {
                self.abandon_session(lease.session);
                Err(e)
            }
        }
    }

    /// Drop a session that never got its document.
    fn abandon_session(&self, session: SessionId) {
        let registry = self.pool.registry();
        registry.invalidate_session(session);
        registry.finish_close_session(session);
        self.pool.release(session);
    }

    pub async fn get_page_count(&self, request: GetPageCount) -> PoolResult<PageCountResponse> {
        let (document, target) = self.resolve(request.document, HandleKind::Document, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::GetPageCount { document },
                CallbackSet::none(),
            )
            .await?;
        Ok(PageCountResponse {
            count: count(OperationKind::GetPageCount, response)?,
        })
    }

    /// Close a document and everything derived from it.
    ///
    /// Handles are invalidated before the native close, and stay invalid
    /// even if the native close fails. Form environments still open on the
    /// document are exited first. A second close reports
    /// `document was already closed`.
    pub async fn close_document(&self, request: CloseDocument) -> PoolResult<()> {
        let service = self.clone();
        self.detached(async move { service.close_session(request).await })
            .await
    }

    async fn close_session(&self, request: CloseDocument) -> PoolResult<()> {
        let registry = self.pool.registry();
        let resolved = registry.resolve_document_for_close(request.document)?;
        let session = resolved.session.ok_or_else(|| PoolError::Internal {
            message: format!("{} has no session", request.document),
        })?;
        let worker = self.pool.worker(resolved.worker)?;

        registry.begin_close_session(session)?;
        let forms: Vec<_> = self
            .take_forms(session)
            .into_iter()
            .filter_map(|registration| {
                registry
                    .native_for(registration.form, resolved.worker, resolved.generation)
                    .ok()
                    .map(|form| (form, registration.callbacks))
            })
            .collect();
        let invalidated = registry.invalidate_session(session);
        let target = CallTarget::anchored(resolved.generation, HandleKind::Document);

        for (form, callbacks) in forms {
            let exited = self
                .pool
                .execute(
                    &worker,
                    NativeRequest::ExitFormFillEnvironment { form },
                    target,
                    None,
                    CallbackSet::with_form(callbacks),
                )
                .await;
            if let Err(e) = exited {
                warn!(session = %session, form, error = %e, "Failed to exit form environment");
            }
        }

        let result = self
            .pool
            .execute(
                &worker,
                NativeRequest::CloseDocument {
                    document: resolved.native,
                },
                target,
                None,
                CallbackSet::none(),
            )
            .await;

        registry.finish_close_session(session);
        self.pool.release(session);

        match result {
            Ok(response) => {
                done(OperationKind::CloseDocument, response)?;
                debug!(session = %session, handles = invalidated, "Document closed");
                Ok(())
            }
            Err(e) => {
                warn!(session = %session, error = %e, "Native close failed, handles already invalidated");
                Err(e)
            }
        }
    }
}
