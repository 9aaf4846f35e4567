//! Opaque identifiers handed out to callers.
//!
//! Native values (pointers in the library's address space) never leave the
//! crate. Callers only see [`Handle`]s, which the
//! [`HandleRegistry`](crate::registry::HandleRegistry) maps back to the native
//! value, the worker that owns it, and the session it belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{EnumString, IntoStaticStr};
use uuid::Uuid;

/// Type tag of a native object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Document,
    Page,
    Bitmap,
    TextPage,
    Search,
    Annotation,
    FormHandle,
    Attachment,
    Bookmark,
    Action,
    Dest,
    StructTree,
    StructElement,
    GlyphPath,
    ClipPath,
    XObject,
    JavascriptAction,
    PageObject,
    Link,
    Font,
    Signature,
    PageRange,
}

impl HandleKind {
    /// Human readable name used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            HandleKind::Document => "document",
            HandleKind::Page => "page",
            HandleKind::Bitmap => "bitmap",
            HandleKind::TextPage => "text page",
            HandleKind::Search => "search",
            HandleKind::Annotation => "annotation",
            HandleKind::FormHandle => "form",
            HandleKind::Attachment => "attachment",
            HandleKind::Bookmark => "bookmark",
            HandleKind::Action => "action",
            HandleKind::Dest => "dest",
            HandleKind::StructTree => "struct tree",
            HandleKind::StructElement => "struct element",
            HandleKind::GlyphPath => "glyph path",
            HandleKind::ClipPath => "clip path",
            HandleKind::XObject => "xobject",
            HandleKind::JavascriptAction => "javascript action",
            HandleKind::PageObject => "page object",
            HandleKind::Link => "link",
            HandleKind::Font => "font",
            HandleKind::Signature => "signature",
            HandleKind::PageRange => "page range",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque reference to a native object living on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    id: Uuid,
    kind: HandleKind,
}

impl Handle {
    pub(crate) fn new(kind: HandleKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }

    pub(crate) fn from_parts(id: Uuid, kind: HandleKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind: &'static str = self.kind.into();
        write!(f, "{}:{}", kind, self.id.simple())
    }
}

/// Identity of one loaded document and everything derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Index of a worker inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(usize);

impl WorkerId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
