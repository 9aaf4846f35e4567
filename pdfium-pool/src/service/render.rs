//! Progressive rendering into bitmaps.

use crate::bridge::{CallbackSet, unexpected};
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, NativeResponse, OperationKind};
use crate::requests::{RenderPageBitmapStart, RenderPageClose, RenderPageContinue};
use crate::responses::RenderResponse;

use super::{PdfiumService, done};

impl PdfiumService {
    /// Start rendering a page into a bitmap living on the same worker.
    ///
    /// With a pause callback the render may return `to_be_continued`; keep
    /// calling [`render_page_continue`](Self::render_page_continue) until it
    /// reports `done`.
    pub async fn render_page_bitmap_start(
        &self,
        request: RenderPageBitmapStart,
    ) -> PoolResult<RenderResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let (bitmap, _) = self.resolve(request.bitmap, HandleKind::Bitmap, Some(&target))?;
        let pause = request.pause.is_some();
        let response = self
            .run(
                &target,
                NativeRequest::RenderPageBitmapStart {
                    bitmap,
                    page,
                    area: request.area,
                    pause,
                },
                CallbackSet::with_pause(request.pause),
            )
            .await?;
        render_status(OperationKind::RenderPageBitmapStart, response)
    }

    pub async fn render_page_continue(
        &self,
        request: RenderPageContinue,
    ) -> PoolResult<RenderResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let pause = request.pause.is_some();
        let response = self
            .run(
                &target,
                NativeRequest::RenderPageContinue { page, pause },
                CallbackSet::with_pause(request.pause),
            )
            .await?;
        render_status(OperationKind::RenderPageContinue, response)
    }

    pub async fn render_page_close(&self, request: RenderPageClose) -> PoolResult<()> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::RenderPageClose { page },
                CallbackSet::none(),
            )
            .await?;
        done(OperationKind::RenderPageClose, response)
    }
}

fn render_status(operation: OperationKind, response: NativeResponse) -> PoolResult<RenderResponse> {
    match response {
        NativeResponse::Render { status } => Ok(RenderResponse { status }),
        other => Err(unexpected(operation, &other)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::PoolError;
    use crate::handle::{Handle, HandleKind};
    use crate::protocol::{RenderArea, RenderStatus};
    use crate::requests::*;
    use crate::service::PdfiumService;
    use crate::service::tests::{load, memory_service};

    const AREA: RenderArea = RenderArea {
        start_x: 0,
        start_y: 0,
        size_x: 200,
        size_y: 100,
        rotate: 0,
        flags: 0,
    };

    async fn bitmap(service: &PdfiumService, document: Option<Handle>) -> Handle {
        service
            .create_bitmap(CreateBitmap {
                width: 200,
                height: 100,
                alpha: false,
                document,
            })
            .await
            .unwrap()
            .bitmap
    }

    #[tokio::test]
    async fn test_paused_render_continues_to_done() {
        let service = memory_service(1).await;
        let document = load(&service, &["render"]).await;
        let bitmap = bitmap(&service, Some(document)).await;
        let page = Page::index(document, 0);

        let polls = Arc::new(AtomicUsize::new(0));
        let pause: crate::PauseCallback = {
            let polls = Arc::clone(&polls);
            Arc::new(move || {
                polls.fetch_add(1, Ordering::SeqCst);
                true
            })
        };

        let status = service
            .render_page_bitmap_start(RenderPageBitmapStart {
                bitmap,
                page,
                area: AREA,
                pause: Some(Arc::clone(&pause)),
            })
            .await
            .unwrap()
            .status;
        assert_eq!(status, RenderStatus::ToBeContinued);

        let continue_render = || RenderPageContinue {
            page,
            pause: Some(Arc::clone(&pause)),
        };
        assert_eq!(
            service
                .render_page_continue(continue_render())
                .await
                .unwrap()
                .status,
            RenderStatus::ToBeContinued
        );
        assert_eq!(
            service
                .render_page_continue(continue_render())
                .await
                .unwrap()
                .status,
            RenderStatus::Done
        );
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        service
            .render_page_close(RenderPageClose { page })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_render_without_pause_runs_to_completion() {
        let service = memory_service(1).await;
        let document = load(&service, &["render"]).await;
        let page = service
            .load_page(LoadPage { document, index: 0 })
            .await
            .unwrap()
            .page;
        let bitmap = bitmap(&service, Some(document)).await;

        let status = service
            .render_page_bitmap_start(RenderPageBitmapStart {
                bitmap,
                page: Page::reference(page),
                area: AREA,
                pause: None,
            })
            .await
            .unwrap()
            .status;
        assert_eq!(status, RenderStatus::Done);
    }

    #[tokio::test]
    async fn test_bitmap_must_share_the_page_worker() {
        let service = memory_service(2).await;
        let first = load(&service, &["a"]).await;
        let second = load(&service, &["b"]).await;
        let bitmap = bitmap(&service, Some(second)).await;

        let err = service
            .render_page_bitmap_start(RenderPageBitmapStart {
                bitmap,
                page: Page::index(first, 0),
                area: AREA,
                pause: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PoolError::HandleNotFound {
                kind: HandleKind::Bitmap
            }
        );
    }
}
