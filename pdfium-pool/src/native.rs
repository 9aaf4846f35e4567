//! Native library layer.
//!
//! A [`NativeLibrary`] is one copy of the library state. It is only ever
//! driven by one worker, one call at a time, so implementations use interior
//! mutability without any locking of their own. Calls that raise callbacks
//! take a [`CallbackBridge`]; implementations must not hold internal borrows
//! across a bridge call, because the caller may issue nested operations on the
//! same library from inside the callback.

mod memory;
#[cfg(feature = "pdfium")]
mod pdfium;

pub use memory::{MemoryLibrary, sample_document};
#[cfg(feature = "pdfium")]
pub use pdfium::PdfiumLibrary;

use std::path::Path;

use crate::config::{LibraryKind, LibrarySettings};
use crate::error::PoolResult;
use crate::protocol::{
    AnnotationSubtype, CallbackReply, CallbackRequest, FormCallbackKind, NativeError, NativePage,
    NativeRequest, NativeResponse, RenderArea, RenderStatus, SearchFlags, TtfMapEntry,
};

pub type NativeResult<T> = Result<T, NativeError>;

/// Worker-side end of the callback channel.
pub trait CallbackBridge {
    fn invoke(&mut self, request: CallbackRequest) -> NativeResult<CallbackReply>;
}

/// One instance of the native library.
pub trait NativeLibrary: Send {
    /// Implementation name, reported in the worker's ready frame.
    fn name(&self) -> &str;

    // Documents
    fn load_document(&self, data: &[u8], password: Option<&str>) -> NativeResult<u64>;
    fn load_document_from_path(&self, path: &Path, password: Option<&str>) -> NativeResult<u64>;
    fn close_document(&self, document: u64) -> NativeResult<()>;
    fn page_count(&self, document: u64) -> NativeResult<i32>;

    // Pages
    fn load_page(&self, document: u64, index: i32) -> NativeResult<u64>;
    fn close_page(&self, page: u64) -> NativeResult<()>;
    /// Page for a page argument. Index lookups reuse one page per document.
    fn page_for(&self, page: NativePage) -> NativeResult<u64>;
    fn page_size(&self, page: u64) -> NativeResult<(f32, f32)>;

    // Text
    fn load_text_page(&self, page: u64) -> NativeResult<u64>;
    fn close_text_page(&self, text_page: u64) -> NativeResult<()>;
    fn count_chars(&self, text_page: u64) -> NativeResult<i32>;
    fn find_start(
        &self,
        text_page: u64,
        query: &str,
        flags: SearchFlags,
        start_index: i32,
    ) -> NativeResult<u64>;
    fn find_next(&self, search: u64) -> NativeResult<bool>;
    fn find_close(&self, search: u64) -> NativeResult<()>;

    // Bitmaps
    fn create_bitmap(&self, width: i32, height: i32, alpha: bool) -> NativeResult<u64>;
    fn destroy_bitmap(&self, bitmap: u64) -> NativeResult<()>;

    // Annotations
    fn annotation_count(&self, page: u64) -> NativeResult<i32>;
    fn create_annotation(&self, page: u64, subtype: AnnotationSubtype) -> NativeResult<u64>;
    fn close_annotation(&self, annotation: u64) -> NativeResult<()>;
    fn remove_annotation(&self, page: u64, index: i32) -> NativeResult<()>;

    // Progressive rendering
    fn render_start(
        &self,
        bitmap: u64,
        page: u64,
        area: RenderArea,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus>;
    fn render_continue(
        &self,
        page: u64,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus>;
    fn render_close(&self, page: u64) -> NativeResult<()>;

    // Form fill
    fn init_form_fill(
        &self,
        document: u64,
        callbacks: &[FormCallbackKind],
        bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<u64>;
    fn exit_form_fill(&self, form: u64, bridge: &mut dyn CallbackBridge) -> NativeResult<()>;
    fn form_on_after_load_page(
        &self,
        page: u64,
        form: u64,
        bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<()>;

    // Stateless
    fn default_ttf_map(&self) -> NativeResult<Vec<TtfMapEntry>>;
}

/// Execute one resolved request against `library`.
///
/// Exhaustive over [`NativeRequest`]; a new operation does not compile until
/// it has an arm here.
pub fn dispatch(
    library: &dyn NativeLibrary,
    request: NativeRequest,
    bridge: &mut dyn CallbackBridge,
) -> NativeResult<NativeResponse> {
    match request {
        NativeRequest::LoadDocument { data, password } => library
            .load_document(&data, password.as_deref())
            .map(|document| NativeResponse::Document { document }),
        NativeRequest::LoadDocumentFromPath { path, password } => library
            .load_document_from_path(Path::new(&path), password.as_deref())
            .map(|document| NativeResponse::Document { document }),
        NativeRequest::CloseDocument { document } => {
            library.close_document(document).map(|_| NativeResponse::Done)
        }
        NativeRequest::GetPageCount { document } => library
            .page_count(document)
            .map(|count| NativeResponse::Count { count }),

        NativeRequest::LoadPage { document, index } => library
            .load_page(document, index)
            .map(|page| NativeResponse::Page { page }),
        NativeRequest::ClosePage { page } => library.close_page(page).map(|_| NativeResponse::Done),
        NativeRequest::GetPageSize { page } => {
            let page = library.page_for(page)?;
            library
                .page_size(page)
                .map(|(width, height)| NativeResponse::PageSize { width, height })
        }

        NativeRequest::LoadTextPage { page } => {
            let page = library.page_for(page)?;
            library
                .load_text_page(page)
                .map(|text_page| NativeResponse::TextPage { text_page })
        }
        NativeRequest::CloseTextPage { text_page } => library
            .close_text_page(text_page)
            .map(|_| NativeResponse::Done),
        NativeRequest::CountChars { text_page } => library
            .count_chars(text_page)
            .map(|count| NativeResponse::Count { count }),
        NativeRequest::FindStart {
            text_page,
            query,
            flags,
            start_index,
        } => library
            .find_start(text_page, &query, flags, start_index)
            .map(|search| NativeResponse::Search { search }),
        NativeRequest::FindNext { search } => library
            .find_next(search)
            .map(|found| NativeResponse::Found { found }),
        NativeRequest::FindClose { search } => {
            library.find_close(search).map(|_| NativeResponse::Done)
        }

        NativeRequest::CreateBitmap {
            width,
            height,
            alpha,
        } => library
            .create_bitmap(width, height, alpha)
            .map(|bitmap| NativeResponse::Bitmap { bitmap }),
        NativeRequest::DestroyBitmap { bitmap } => {
            library.destroy_bitmap(bitmap).map(|_| NativeResponse::Done)
        }

        NativeRequest::GetAnnotationCount { page } => {
            let page = library.page_for(page)?;
            library
                .annotation_count(page)
                .map(|count| NativeResponse::Count { count })
        }
        NativeRequest::CreateAnnotation { page, subtype } => {
            let page = library.page_for(page)?;
            library
                .create_annotation(page, subtype)
                .map(|annotation| NativeResponse::Annotation { annotation })
        }
        NativeRequest::CloseAnnotation { annotation } => library
            .close_annotation(annotation)
            .map(|_| NativeResponse::Done),
        NativeRequest::RemoveAnnotation { page, index } => {
            let page = library.page_for(page)?;
            library
                .remove_annotation(page, index)
                .map(|_| NativeResponse::Done)
        }

        NativeRequest::RenderPageBitmapStart {
            bitmap,
            page,
            area,
            pause,
        } => {
            let page = library.page_for(page)?;
            library
                .render_start(bitmap, page, area, pause.then_some(bridge))
                .map(|status| NativeResponse::Render { status })
        }
        NativeRequest::RenderPageContinue { page, pause } => {
            let page = library.page_for(page)?;
            library
                .render_continue(page, pause.then_some(bridge))
                .map(|status| NativeResponse::Render { status })
        }
        NativeRequest::RenderPageClose { page } => {
            let page = library.page_for(page)?;
            library.render_close(page).map(|_| NativeResponse::Done)
        }

        NativeRequest::InitFormFillEnvironment {
            document,
            callbacks,
        } => library
            .init_form_fill(document, &callbacks, bridge)
            .map(|form| NativeResponse::Form { form }),
        NativeRequest::ExitFormFillEnvironment { form } => library
            .exit_form_fill(form, bridge)
            .map(|_| NativeResponse::Done),
        NativeRequest::FormOnAfterLoadPage { form, page } => {
            let page = library.page_for(page)?;
            library
                .form_on_after_load_page(page, form, bridge)
                .map(|_| NativeResponse::Done)
        }

        NativeRequest::GetDefaultTtfMap => library
            .default_ttf_map()
            .map(|entries| NativeResponse::TtfMap { entries }),
    }
}

/// Open the library selected by `settings`.
pub fn open_library(settings: &LibrarySettings) -> PoolResult<Box<dyn NativeLibrary>> {
    match settings.kind {
        LibraryKind::Memory => Ok(Box::new(MemoryLibrary::new())),
        #[cfg(feature = "pdfium")]
        LibraryKind::Pdfium => Ok(Box::new(PdfiumLibrary::bind(settings.path.as_deref())?)),
        #[cfg(not(feature = "pdfium"))]
        LibraryKind::Pdfium => Err(crate::error::PoolError::Config {
            message: "pdfium-pool was built without the `pdfium` feature".to_string(),
        }),
    }
}

/// Bridge for calls made without a caller attached; every callback fails.
#[cfg(test)]
pub(crate) struct NoCallbacks;

#[cfg(test)]
impl CallbackBridge for NoCallbacks {
    fn invoke(&mut self, request: CallbackRequest) -> NativeResult<CallbackReply> {
        Err(NativeError::Callback {
            message: format!("no callback registered for {:?}", request),
        })
    }
}
