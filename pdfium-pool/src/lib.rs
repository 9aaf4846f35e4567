//! A pool of isolated PDFium instances behind one typed facade.
//!
//! [`PdfiumService`] accepts requests from any number of concurrent callers,
//! routes each to the [`worker`](WorkerPool) that owns the document it
//! touches, and hands back opaque [`Handle`]s instead of native pointers.
//! Workers run the library in-process, in a `pdfium-pool-worker` child
//! process, or inside a WebAssembly sandbox.

pub mod bridge;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod native;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod requests;
pub mod responses;
pub mod service;
pub mod worker;

pub use bridge::{CallbackScope, FormFillCallbacks, FormRect, PauseCallback};
pub use config::{
    BackendKind, LibraryKind, LibrarySettings, PoolConfig, RestartPolicy, load_config,
    load_config_from,
};
pub use error::{PdfiumErrorCode, PoolError, PoolResult};
pub use handle::{Handle, HandleKind, SessionId, WorkerId};
pub use logging::init_logging;
pub use pool::{PoolStats, SessionLease, WorkerPool};
pub use protocol::{
    AnnotationSubtype, LocalTime, OperationKind, RenderArea, RenderStatus, SearchFlags,
    TtfMapEntry,
};
pub use service::PdfiumService;
pub use worker::{WorkerState, WorkerStats, serve};
