//! Pool configuration.

mod loader;

pub use loader::{load_config, load_config_from, load_library_settings};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{PoolError, PoolResult};
use crate::protocol::OperationKind;

/// How a worker hosts its library instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Direct calls on the caller's process, serialized by a lock
    InProcess,
    /// Calls proxied to a `pdfium-pool-worker` child process
    Subprocess,
    /// Calls proxied into a WebAssembly instance
    Sandbox,
}

impl BackendKind {
    /// Whether this backend can perform `operation` at all.
    pub fn supports(&self, operation: OperationKind) -> bool {
        match self {
            BackendKind::InProcess | BackendKind::Subprocess => true,
            // The guest has no view of the host filesystem
            BackendKind::Sandbox => operation != OperationKind::LoadDocumentFromPath,
        }
    }
}

/// Which native library implementation a worker opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    /// Deterministic in-memory implementation
    Memory,
    /// libpdfium, loaded at runtime
    Pdfium,
}

impl Default for LibraryKind {
    fn default() -> Self {
        if cfg!(feature = "pdfium") {
            LibraryKind::Pdfium
        } else {
            LibraryKind::Memory
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Number of workers
    #[serde(default = "default_size")]
    pub size: usize,

    /// Documents a single worker may hold open at once
    #[serde(default = "default_sessions_per_worker")]
    pub sessions_per_worker: usize,

    /// Default wait for a free session slot
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Upper bound for one native call, callbacks included.
    /// Not available for the in-process backend.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// How many closed document handles are remembered for
    /// "already closed" reporting
    #[serde(default = "default_closed_document_memory")]
    pub closed_document_memory: usize,

    #[serde(default)]
    pub restart: RestartPolicy,

    #[serde(default)]
    pub library: LibrarySettings,

    #[serde(default)]
    pub subprocess: SubprocessSettings,

    #[serde(default)]
    pub sandbox: SandboxSettings,
}

/// What happens to a worker after it crashed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Restarts allowed per worker before it is withdrawn from the pool
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_restarts: default_max_restarts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RestartPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Native library selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarySettings {
    #[serde(default)]
    pub kind: LibraryKind,

    /// Directory containing libpdfium. Falls back to the system library.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubprocessSettings {
    /// Worker executable. Defaults to `pdfium-pool-worker` next to the
    /// current executable.
    #[serde(default)]
    pub program: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// WebAssembly module (`.wasm` or `.wat`) exporting the dispatch ABI
    #[serde(default)]
    pub module_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            size: default_size(),
            sessions_per_worker: default_sessions_per_worker(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            call_timeout_ms: None,
            closed_document_memory: default_closed_document_memory(),
            restart: RestartPolicy::default(),
            library: LibrarySettings::default(),
            subprocess: SubprocessSettings::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Total number of documents the pool holds open at once.
    pub fn capacity(&self) -> usize {
        self.size * self.sessions_per_worker
    }

    /// Reject combinations the pool cannot honor.
    pub fn validate(&self) -> PoolResult<()> {
        if self.size == 0 {
            return Err(config_error("pool size must be at least 1"));
        }
        if self.sessions_per_worker == 0 {
            return Err(config_error("sessions_per_worker must be at least 1"));
        }
        if self.closed_document_memory == 0 {
            return Err(config_error("closed_document_memory must be at least 1"));
        }

        match self.backend {
            BackendKind::InProcess => {
                if self.call_timeout_ms.is_some() {
                    return Err(config_error(
                        "call_timeout_ms cannot be enforced on the in_process backend",
                    ));
                }
                // libpdfium keeps global state, one copy per process
                if self.library.kind == LibraryKind::Pdfium && self.size > 1 {
                    return Err(config_error(
                        "the in_process backend can host only one pdfium worker",
                    ));
                }
            }
            BackendKind::Subprocess => {}
            BackendKind::Sandbox => {
                if self.sandbox.module_path.is_none() {
                    return Err(config_error("sandbox backend requires sandbox.module_path"));
                }
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> PoolError {
    PoolError::Config {
        message: message.to_string(),
    }
}

// Default value functions
fn default_backend() -> BackendKind {
    BackendKind::InProcess
}

fn default_size() -> usize {
    1
}

fn default_sessions_per_worker() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_closed_document_memory() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    100
}
