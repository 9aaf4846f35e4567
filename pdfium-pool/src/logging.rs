//! Tracing subscriber setup shared by library users and the worker binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "pdfium_pool=info";

/// Install a compact stderr subscriber, filtered by `RUST_LOG`.
///
/// Logs never go to stdout: a worker process uses stdout for its frames.
/// Does nothing if a global subscriber is already installed.
pub fn init_logging() {
    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(format)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init();
}
