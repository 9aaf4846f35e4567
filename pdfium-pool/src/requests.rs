//! Typed requests accepted by [`PdfiumService`](crate::PdfiumService).

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::{FormFillCallbacks, PauseCallback};
use crate::error::{PoolError, PoolResult};
use crate::handle::Handle;
use crate::protocol::{AnnotationSubtype, RenderArea, SearchFlags};

/// A page of a document addressed by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndex {
    pub document: Handle,
    pub index: i32,
}

/// Page argument: either a loaded page handle or an index into a document.
///
/// When both are set the index wins. Pages addressed by index are loaded and
/// cached by the library; the caller never sees a handle for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub by_index: Option<PageIndex>,
    pub by_reference: Option<Handle>,
}

impl Page {
    pub fn reference(page: Handle) -> Self {
        Self {
            by_index: None,
            by_reference: Some(page),
        }
    }

    pub fn index(document: Handle, index: i32) -> Self {
        Self {
            by_index: Some(PageIndex { document, index }),
            by_reference: None,
        }
    }

    pub(crate) fn locate(&self) -> PoolResult<PageLocator> {
        match (self.by_index, self.by_reference) {
            (Some(index), _) => Ok(PageLocator::Index(index)),
            (None, Some(page)) => Ok(PageLocator::Reference(page)),
            (None, None) => Err(PoolError::PageLocatorMissing),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PageLocator {
    Index(PageIndex),
    Reference(Handle),
}

#[derive(Debug, Clone, Default)]
pub struct LoadDocument {
    pub data: Vec<u8>,
    pub password: Option<String>,
    /// How long to wait for a free document slot; the pool default if unset
    pub acquire_timeout: Option<Duration>,
}

/// Load a document streamed from `reader`, which must yield `size` bytes.
pub struct LoadDocumentFromReader<R> {
    pub reader: R,
    pub size: u64,
    pub password: Option<String>,
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadDocumentFromPath {
    pub path: PathBuf,
    pub password: Option<String>,
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDocument {
    pub document: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetPageCount {
    pub document: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPage {
    pub document: Handle,
    pub index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePage {
    pub page: Handle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetPageSize {
    pub page: Page,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTextPage {
    pub page: Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseTextPage {
    pub text_page: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountChars {
    pub text_page: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindStart {
    pub text_page: Handle,
    pub query: String,
    pub flags: SearchFlags,
    pub start_index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindNext {
    pub search: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindClose {
    pub search: Handle,
}

/// Create a bitmap. With `document` set it lives on that document's worker
/// and is closed with it; otherwise it is placed on any worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateBitmap {
    pub width: i32,
    pub height: i32,
    pub alpha: bool,
    pub document: Option<Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyBitmap {
    pub bitmap: Handle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAnnotationCount {
    pub page: Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateAnnotation {
    pub page: Page,
    pub subtype: AnnotationSubtype,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAnnotation {
    pub annotation: Handle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveAnnotation {
    pub page: Page,
    pub index: i32,
}

#[derive(Clone)]
pub struct RenderPageBitmapStart {
    pub bitmap: Handle,
    pub page: Page,
    pub area: RenderArea,
    /// Polled between render steps; `true` pauses the render
    pub pause: Option<PauseCallback>,
}

#[derive(Clone, Default)]
pub struct RenderPageContinue {
    pub page: Page,
    pub pause: Option<PauseCallback>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderPageClose {
    pub page: Page,
}

#[derive(Debug, Clone)]
pub struct InitFormFillEnvironment {
    pub document: Handle,
    pub callbacks: FormFillCallbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitFormFillEnvironment {
    pub form: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormOnAfterLoadPage {
    pub form: Handle,
    pub page: Page,
}
