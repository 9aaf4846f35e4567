use thiserror::Error;

use crate::config::BackendKind;
use crate::handle::{HandleKind, WorkerId};
use crate::protocol::{NativeError, OperationKind};

/// Main pool error type
///
/// Every variant carries plain data so callers can compare errors by value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("either page reference or index should be given")]
    PageLocatorMissing,

    #[error("callback {name} is required")]
    MissingCallback { name: &'static str },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error(
        "could not find {kind} handle, perhaps the {kind} was already closed or you tried to share {kind} handles between instances"
    )]
    HandleNotFound { kind: HandleKind },

    #[error("{kind} was already closed")]
    AlreadyClosed { kind: HandleKind },

    #[error("{message}")]
    Native {
        operation: OperationKind,
        message: String,
    },

    #[error("{0}")]
    Pdfium(#[from] PdfiumErrorCode),

    #[error("operation {operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: OperationKind,
        backend: BackendKind,
    },

    #[error("{worker} crashed: {reason}")]
    WorkerCrashed { worker: WorkerId, reason: String },

    #[error("operation {operation} timed out after {after_ms}ms")]
    Timeout {
        operation: OperationKind,
        after_ms: u64,
    },

    #[error("pool exhausted: no worker became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("no healthy worker available")]
    NoHealthyWorker,

    #[error("callback invoked after its call returned")]
    CallbackExpired,

    #[error("callback failed: {message}")]
    CallbackFailed { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error codes reported by `FPDF_GetLastError` after a failed load.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfiumErrorCode {
    #[error("unknown error")]
    Unknown,
    #[error("file not found or could not be opened")]
    File,
    #[error("file not in PDF format or corrupted")]
    Format,
    #[error("password required or incorrect password")]
    Password,
    #[error("unsupported security scheme")]
    Security,
    #[error("page not found or content error")]
    Page,
}

impl PdfiumErrorCode {
    pub const SUCCESS: u32 = 0;
    pub const UNKNOWN: u32 = 1;
    pub const FILE: u32 = 2;
    pub const FORMAT: u32 = 3;
    pub const PASSWORD: u32 = 4;
    pub const SECURITY: u32 = 5;
    pub const PAGE: u32 = 6;

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::FILE => PdfiumErrorCode::File,
            Self::FORMAT => PdfiumErrorCode::Format,
            Self::PASSWORD => PdfiumErrorCode::Password,
            Self::SECURITY => PdfiumErrorCode::Security,
            Self::PAGE => PdfiumErrorCode::Page,
            _ => PdfiumErrorCode::Unknown,
        }
    }
}

impl PoolError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            PoolError::PageLocatorMissing => "page_locator_missing",
            PoolError::MissingCallback { .. } => "missing_callback",
            PoolError::InvalidArgument { .. } => "invalid_argument",
            PoolError::HandleNotFound { .. } => "handle_not_found",
            PoolError::AlreadyClosed { .. } => "already_closed",
            PoolError::Native { .. } => "native_error",
            PoolError::Pdfium(PdfiumErrorCode::Unknown) => "pdfium_unknown",
            PoolError::Pdfium(PdfiumErrorCode::File) => "pdfium_file",
            PoolError::Pdfium(PdfiumErrorCode::Format) => "pdfium_format",
            PoolError::Pdfium(PdfiumErrorCode::Password) => "pdfium_password",
            PoolError::Pdfium(PdfiumErrorCode::Security) => "pdfium_security",
            PoolError::Pdfium(PdfiumErrorCode::Page) => "pdfium_page",
            PoolError::Unsupported { .. } => "unsupported",
            PoolError::WorkerCrashed { .. } => "worker_crashed",
            PoolError::Timeout { .. } => "timeout",
            PoolError::PoolExhausted { .. } => "pool_exhausted",
            PoolError::NoHealthyWorker => "no_healthy_worker",
            PoolError::CallbackExpired => "callback_expired",
            PoolError::CallbackFailed { .. } => "callback_failed",
            PoolError::Config { .. } => "config_error",
            PoolError::Internal { .. } => "internal_error",
        }
    }

    /// Errors after which the worker that produced them must be restarted.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::WorkerCrashed { .. } | PoolError::Timeout { .. }
        )
    }

    /// Argument errors are detected before any native call is made.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            PoolError::PageLocatorMissing
                | PoolError::MissingCallback { .. }
                | PoolError::InvalidArgument { .. }
        )
    }

    /// Translate a native-side failure of `operation` on a `backend` worker.
    pub(crate) fn from_native(
        operation: OperationKind,
        backend: BackendKind,
        error: NativeError,
    ) -> Self {
        match error {
            NativeError::LastError { code } => PoolError::Pdfium(PdfiumErrorCode::from_code(code)),
            NativeError::Failed { message } => PoolError::Native { operation, message },
            NativeError::Unsupported { operation } => PoolError::Unsupported { operation, backend },
            NativeError::InvalidArgument { message } => PoolError::InvalidArgument { message },
            NativeError::Callback { message } => PoolError::CallbackFailed { message },
        }
    }

    pub fn is_handle_error(&self) -> bool {
        matches!(
            self,
            PoolError::HandleNotFound { .. } | PoolError::AlreadyClosed { .. }
        )
    }
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
