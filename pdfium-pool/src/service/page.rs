use crate::bridge::{CallbackSet, unexpected};
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, NativeResponse, OperationKind};
use crate::requests::{ClosePage, GetPageSize, LoadPage};
use crate::responses::{PageResponse, PageSizeResponse};

use super::{PdfiumService, created, done};

impl PdfiumService {
    pub async fn load_page(&self, request: LoadPage) -> PoolResult<PageResponse> {
        let (document, target) = self.resolve(request.document, HandleKind::Document, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::LoadPage {
                    document,
                    index: request.index,
                },
                CallbackSet::none(),
            )
            .await?;
        let native = created(OperationKind::LoadPage, response)?;
        let page = self
            .adopt(
                &target,
                native,
                HandleKind::Page,
                NativeRequest::ClosePage { page: native },
            )
            .await?;
        Ok(PageResponse { page })
    }

    pub async fn close_page(&self, request: ClosePage) -> PoolResult<()> {
        let (page, target) = self.resolve(request.page, HandleKind::Page, None)?;
        self.pool.registry().invalidate(request.page);
        let response = self
            .run(&target, NativeRequest::ClosePage { page }, CallbackSet::none())
            .await?;
        done(OperationKind::ClosePage, response)
    }

    pub async fn get_page_size(&self, request: GetPageSize) -> PoolResult<PageSizeResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        match self
            .run(&target, NativeRequest::GetPageSize { page }, CallbackSet::none())
            .await?
        {
            NativeResponse::PageSize { width, height } => Ok(PageSizeResponse { width, height }),
            other => Err(unexpected(OperationKind::GetPageSize, &other)),
        }
    }
}
