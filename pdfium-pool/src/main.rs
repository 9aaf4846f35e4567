//! `pdfium-pool-worker`: one library instance serving a pool over stdio.
//!
//! Started by the sub-process backend. Requests arrive as JSON lines on
//! stdin, responses and callbacks leave on stdout, logs go to stderr.

use std::io;
use std::process::ExitCode;

use tracing::{error, info};

use pdfium_pool::config::load_library_settings;
use pdfium_pool::init_logging;
use pdfium_pool::native::open_library;
use pdfium_pool::serve;

fn main() -> ExitCode {
    init_logging();

    let worker = std::env::var("PDFIUM_POOL_WORKER_ID").unwrap_or_else(|_| "-".to_string());
    info!(
        worker = %worker,
        pid = std::process::id(),
        "Starting pdfium-pool-worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let settings = match load_library_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to load library settings");
            return ExitCode::FAILURE;
        }
    };
    let library = match open_library(&settings) {
        Ok(library) => library,
        Err(e) => {
            error!(error = %e, library = %settings.kind, "Failed to open library");
            return ExitCode::FAILURE;
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    match serve(stdin.lock(), stdout.lock(), library.as_ref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker channel failed");
            ExitCode::FAILURE
        }
    }
}
