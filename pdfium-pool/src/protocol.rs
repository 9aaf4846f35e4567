//! Operation envelope shared by every backend.
//!
//! A [`NativeRequest`] is an operation whose handles have already been
//! resolved to native values. The same types travel over the sub-process pipe
//! and into the WebAssembly sandbox, so everything here is serde-serializable.

mod callback;
mod frame;

pub use callback::{CallbackReply, CallbackRequest, FormCallbackKind, LocalTime};
pub use frame::Frame;
pub(crate) use frame::{FrameChannel, base64_bytes};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// All operations as an exhaustive enum.
///
/// Adding an operation requires a variant here, a [`NativeRequest`] variant,
/// and an arm in [`crate::native::dispatch`] (compile error if missing due to
/// exhaustive match).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    // Documents
    LoadDocument,
    LoadDocumentFromPath,
    CloseDocument,
    GetPageCount,

    // Pages
    LoadPage,
    ClosePage,
    GetPageSize,

    // Text
    LoadTextPage,
    CloseTextPage,
    CountChars,
    FindStart,
    FindNext,
    FindClose,

    // Bitmaps
    CreateBitmap,
    DestroyBitmap,

    // Annotations
    GetAnnotationCount,
    CreateAnnotation,
    CloseAnnotation,
    RemoveAnnotation,

    // Progressive rendering
    RenderPageBitmapStart,
    RenderPageContinue,
    RenderPageClose,

    // Form fill
    InitFormFillEnvironment,
    ExitFormFillEnvironment,
    FormOnAfterLoadPage,

    // Stateless
    GetDefaultTtfMap,
}

/// Page argument after resolution: either a loaded page or a document index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum NativePage {
    Reference { page: u64 },
    Index { document: u64, index: i32 },
}

/// Annotation subtypes, numbered as `FPDF_ANNOT_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnnotationSubtype {
    Text,
    Link,
    FreeText,
    Line,
    Square,
    Circle,
    Polygon,
    Polyline,
    Highlight,
    Underline,
    Squiggly,
    StrikeOut,
    Stamp,
    Caret,
    Ink,
    Popup,
    FileAttachment,
    Widget,
}

impl AnnotationSubtype {
    pub fn code(&self) -> i32 {
        match self {
            AnnotationSubtype::Text => 1,
            AnnotationSubtype::Link => 2,
            AnnotationSubtype::FreeText => 3,
            AnnotationSubtype::Line => 4,
            AnnotationSubtype::Square => 5,
            AnnotationSubtype::Circle => 6,
            AnnotationSubtype::Polygon => 7,
            AnnotationSubtype::Polyline => 8,
            AnnotationSubtype::Highlight => 9,
            AnnotationSubtype::Underline => 10,
            AnnotationSubtype::Squiggly => 11,
            AnnotationSubtype::StrikeOut => 12,
            AnnotationSubtype::Stamp => 13,
            AnnotationSubtype::Caret => 14,
            AnnotationSubtype::Ink => 15,
            AnnotationSubtype::Popup => 16,
            AnnotationSubtype::FileAttachment => 17,
            AnnotationSubtype::Widget => 20,
        }
    }

    /// Subtypes `FPDFPage_CreateAnnot` accepts.
    pub fn is_creatable(&self) -> bool {
        matches!(
            self,
            AnnotationSubtype::Circle
                | AnnotationSubtype::FileAttachment
                | AnnotationSubtype::FreeText
                | AnnotationSubtype::Highlight
                | AnnotationSubtype::Ink
                | AnnotationSubtype::Link
                | AnnotationSubtype::Popup
                | AnnotationSubtype::Square
                | AnnotationSubtype::Squiggly
                | AnnotationSubtype::Stamp
                | AnnotationSubtype::StrikeOut
                | AnnotationSubtype::Text
                | AnnotationSubtype::Underline
        )
    }
}

/// Progressive render status, numbered as `FPDF_RENDER_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Ready,
    ToBeContinued,
    Done,
    Failed,
}

/// Render target rectangle and options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderArea {
    pub start_x: i32,
    pub start_y: i32,
    pub size_x: i32,
    pub size_y: i32,
    pub rotate: i32,
    pub flags: i32,
}

/// Text search options, as `FPDF_MATCHCASE` / `FPDF_MATCHWHOLEWORD`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFlags {
    pub match_case: bool,
    pub match_whole_word: bool,
}

impl SearchFlags {
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.match_case {
            bits |= 0x1;
        }
        if self.match_whole_word {
            bits |= 0x2;
        }
        bits
    }
}

/// One entry of the default charset to font mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtfMapEntry {
    pub charset: i32,
    pub font_name: String,
}

/// An operation with every handle resolved to its native value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum NativeRequest {
    LoadDocument {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        password: Option<String>,
    },
    LoadDocumentFromPath {
        path: String,
        password: Option<String>,
    },
    CloseDocument {
        document: u64,
    },
    GetPageCount {
        document: u64,
    },
    LoadPage {
        document: u64,
        index: i32,
    },
    ClosePage {
        page: u64,
    },
    GetPageSize {
        page: NativePage,
    },
    LoadTextPage {
        page: NativePage,
    },
    CloseTextPage {
        text_page: u64,
    },
    CountChars {
        text_page: u64,
    },
    FindStart {
        text_page: u64,
        query: String,
        flags: SearchFlags,
        start_index: i32,
    },
    FindNext {
        search: u64,
    },
    FindClose {
        search: u64,
    },
    CreateBitmap {
        width: i32,
        height: i32,
        alpha: bool,
    },
    DestroyBitmap {
        bitmap: u64,
    },
    GetAnnotationCount {
        page: NativePage,
    },
    CreateAnnotation {
        page: NativePage,
        subtype: AnnotationSubtype,
    },
    CloseAnnotation {
        annotation: u64,
    },
    RemoveAnnotation {
        page: NativePage,
        index: i32,
    },
    RenderPageBitmapStart {
        bitmap: u64,
        page: NativePage,
        area: RenderArea,
        /// Whether the caller registered a pause callback.
        pause: bool,
    },
    RenderPageContinue {
        page: NativePage,
        pause: bool,
    },
    RenderPageClose {
        page: NativePage,
    },
    InitFormFillEnvironment {
        document: u64,
        callbacks: Vec<FormCallbackKind>,
    },
    ExitFormFillEnvironment {
        form: u64,
    },
    FormOnAfterLoadPage {
        form: u64,
        page: NativePage,
    },
    GetDefaultTtfMap,
}

impl NativeRequest {
    pub fn operation(&self) -> OperationKind {
        match self {
            NativeRequest::LoadDocument { .. } => OperationKind::LoadDocument,
            NativeRequest::LoadDocumentFromPath { .. } => OperationKind::LoadDocumentFromPath,
            NativeRequest::CloseDocument { .. } => OperationKind::CloseDocument,
            NativeRequest::GetPageCount { .. } => OperationKind::GetPageCount,
            NativeRequest::LoadPage { .. } => OperationKind::LoadPage,
            NativeRequest::ClosePage { .. } => OperationKind::ClosePage,
            NativeRequest::GetPageSize { .. } => OperationKind::GetPageSize,
            NativeRequest::LoadTextPage { .. } => OperationKind::LoadTextPage,
            NativeRequest::CloseTextPage { .. } => OperationKind::CloseTextPage,
            NativeRequest::CountChars { .. } => OperationKind::CountChars,
            NativeRequest::FindStart { .. } => OperationKind::FindStart,
            NativeRequest::FindNext { .. } => OperationKind::FindNext,
            NativeRequest::FindClose { .. } => OperationKind::FindClose,
            NativeRequest::CreateBitmap { .. } => OperationKind::CreateBitmap,
            NativeRequest::DestroyBitmap { .. } => OperationKind::DestroyBitmap,
            NativeRequest::GetAnnotationCount { .. } => OperationKind::GetAnnotationCount,
            NativeRequest::CreateAnnotation { .. } => OperationKind::CreateAnnotation,
            NativeRequest::CloseAnnotation { .. } => OperationKind::CloseAnnotation,
            NativeRequest::RemoveAnnotation { .. } => OperationKind::RemoveAnnotation,
            NativeRequest::RenderPageBitmapStart { .. } => OperationKind::RenderPageBitmapStart,
            NativeRequest::RenderPageContinue { .. } => OperationKind::RenderPageContinue,
            NativeRequest::RenderPageClose { .. } => OperationKind::RenderPageClose,
            NativeRequest::InitFormFillEnvironment { .. } => {
                OperationKind::InitFormFillEnvironment
            }
            NativeRequest::ExitFormFillEnvironment { .. } => {
                OperationKind::ExitFormFillEnvironment
            }
            NativeRequest::FormOnAfterLoadPage { .. } => OperationKind::FormOnAfterLoadPage,
            NativeRequest::GetDefaultTtfMap => OperationKind::GetDefaultTtfMap,
        }
    }
}

/// Result of a successful native call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeResponse {
    Document { document: u64 },
    Page { page: u64 },
    TextPage { text_page: u64 },
    Search { search: u64 },
    Bitmap { bitmap: u64 },
    Annotation { annotation: u64 },
    Form { form: u64 },
    Count { count: i32 },
    PageSize { width: f32, height: f32 },
    Found { found: bool },
    Render { status: RenderStatus },
    TtfMap { entries: Vec<TtfMapEntry> },
    Done,
}

impl NativeResponse {
    pub fn name(&self) -> &'static str {
        match self {
            NativeResponse::Document { .. } => "document",
            NativeResponse::Page { .. } => "page",
            NativeResponse::TextPage { .. } => "text_page",
            NativeResponse::Search { .. } => "search",
            NativeResponse::Bitmap { .. } => "bitmap",
            NativeResponse::Annotation { .. } => "annotation",
            NativeResponse::Form { .. } => "form",
            NativeResponse::Count { .. } => "count",
            NativeResponse::PageSize { .. } => "page_size",
            NativeResponse::Found { .. } => "found",
            NativeResponse::Render { .. } => "render",
            NativeResponse::TtfMap { .. } => "ttf_map",
            NativeResponse::Done => "done",
        }
    }
}

/// Native-side failure, translated into [`crate::PoolError`] by the facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum NativeError {
    /// A load failed; `code` is the value of `FPDF_GetLastError`.
    LastError { code: u32 },
    /// The call returned a failure or empty result.
    Failed { message: String },
    Unsupported { operation: OperationKind },
    InvalidArgument { message: String },
    /// A callback round trip failed.
    Callback { message: String },
}

impl NativeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NativeError::Failed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_operation_names() {
        assert_eq!(OperationKind::RemoveAnnotation.to_string(), "remove_annotation");
        assert_eq!(
            OperationKind::from_str("get_default_ttf_map").unwrap(),
            OperationKind::GetDefaultTtfMap
        );
        assert!(OperationKind::from_str("render_everything").is_err());
    }

    #[test]
    fn test_request_wire_shape() {
        let request = NativeRequest::LoadDocument {
            data: b"%PDF-1.7".to_vec(),
            password: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["operation"], "load_document");
        assert_eq!(json["data"], "JVBERi0xLjc=");

        let page = NativeRequest::GetPageSize {
            page: NativePage::Index {
                document: 7,
                index: 2,
            },
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["page"]["by"], "index");
        assert_eq!(page.operation(), OperationKind::GetPageSize);
    }

    #[test]
    fn test_search_flag_bits() {
        let flags = SearchFlags {
            match_case: true,
            match_whole_word: true,
        };
        assert_eq!(flags.bits(), 0x3);
        assert_eq!(SearchFlags::default().bits(), 0);
    }
}
