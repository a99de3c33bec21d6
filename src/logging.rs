//! Tracing setup for applications embedding the session client.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix when logging to a directory
const LOG_FILE_PREFIX: &str = "sessionsync.log";

/// Initialize the tracing subscriber for logging.
///
/// Use the RUST_LOG env var to control the level (e.g. `RUST_LOG=debug`);
/// the default is `warn`. With `log_dir`, events are also written to a daily
/// rolling file there; keep the returned guard alive to flush it.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // Ignore the error when a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .try_init();

    guard
}
