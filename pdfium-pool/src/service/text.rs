//! Text pages and text search.

use crate::bridge::{CallbackSet, unexpected};
use crate::error::PoolResult;
use crate::handle::HandleKind;
use crate::protocol::{NativeRequest, NativeResponse, OperationKind};
use crate::requests::{CloseTextPage, CountChars, FindClose, FindNext, FindStart, LoadTextPage};
use crate::responses::{CountCharsResponse, FindNextResponse, SearchResponse, TextPageResponse};

use super::{PdfiumService, count, created, done};

impl PdfiumService {
    pub async fn load_text_page(&self, request: LoadTextPage) -> PoolResult<TextPageResponse> {
        let (page, target) = self.resolve_page(&request.page, None)?;
        let response = self
            .run(&target, NativeRequest::LoadTextPage { page }, CallbackSet::none())
            .await?;
        let native = created(OperationKind::LoadTextPage, response)?;
        let text_page = self
            .adopt(
                &target,
                native,
                HandleKind::TextPage,
                NativeRequest::CloseTextPage { text_page: native },
            )
            .await?;
        Ok(TextPageResponse { text_page })
    }

    pub async fn close_text_page(&self, request: CloseTextPage) -> PoolResult<()> {
        let (text_page, target) = self.resolve(request.text_page, HandleKind::TextPage, None)?;
        self.pool.registry().invalidate(request.text_page);
        let response = self
            .run(
                &target,
                NativeRequest::CloseTextPage { text_page },
                CallbackSet::none(),
            )
            .await?;
        done(OperationKind::CloseTextPage, response)
    }

    pub async fn count_chars(&self, request: CountChars) -> PoolResult<CountCharsResponse> {
        let (text_page, target) = self.resolve(request.text_page, HandleKind::TextPage, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::CountChars { text_page },
                CallbackSet::none(),
            )
            .await?;
        Ok(CountCharsResponse {
            count: count(OperationKind::CountChars, response)?,
        })
    }

    pub async fn find_start(&self, request: FindStart) -> PoolResult<SearchResponse> {
        let (text_page, target) = self.resolve(request.text_page, HandleKind::TextPage, None)?;
        let response = self
            .run(
                &target,
                NativeRequest::FindStart {
                    text_page,
                    query: request.query,
                    flags: request.flags,
                    start_index: request.start_index,
                },
                CallbackSet::none(),
            )
            .await?;
        let native = created(OperationKind::FindStart, response)?;
        let search = self
            .adopt(
                &target,
                native,
                HandleKind::Search,
                NativeRequest::FindClose { search: native },
            )
            .await?;
        Ok(SearchResponse { search })
    }

    pub async fn find_next(&self, request: FindNext) -> PoolResult<FindNextResponse> {
        let (search, target) = self.resolve(request.search, HandleKind::Search, None)?;
        match self
            .run(&target, NativeRequest::FindNext { search }, CallbackSet::none())
            .await?
        {
            NativeResponse::Found { found } => Ok(FindNextResponse { found }),
            other => Err(unexpected(OperationKind::FindNext, &other)),
        }
    }

    pub async fn find_close(&self, request: FindClose) -> PoolResult<()> {
        let (search, target) = self.resolve(request.search, HandleKind::Search, None)?;
        self.pool.registry().invalidate(request.search);
        let response = self
            .run(&target, NativeRequest::FindClose { search }, CallbackSet::none())
            .await?;
        done(OperationKind::FindClose, response)
    }
}
