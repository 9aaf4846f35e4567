//! Typed responses returned by [`PdfiumService`](crate::PdfiumService).

use serde::Serialize;

use crate::handle::Handle;
use crate::protocol::{RenderStatus, TtfMapEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DocumentResponse {
    pub document: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageCountResponse {
    pub count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageResponse {
    pub page: Handle,
}

/// Page size in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PageSizeResponse {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TextPageResponse {
    pub text_page: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountCharsResponse {
    pub count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchResponse {
    pub search: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FindNextResponse {
    pub found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitmapResponse {
    pub bitmap: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnnotationCountResponse {
    pub count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnnotationResponse {
    pub annotation: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenderResponse {
    pub status: RenderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormResponse {
    pub form: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TtfMapResponse {
    pub entries: Vec<TtfMapEntry>,
}
