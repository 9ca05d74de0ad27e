//! Tracing setup, adapted from the teacher's CLI entry point into a
//! library-exposed helper: a stdout layer for clean, human-facing output
//! plus an optional non-blocking file layer, both governed by `RUST_LOG`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

/// Initializes the global tracing subscriber. Returns the file appender's
/// guard when `log_file` is set — the caller must keep it alive for the
/// duration of the program, or buffered lines are lost on drop.
pub fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let filename = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("wire-bus.log"));
            let appender = tracing_appender::rolling::daily(dir, filename);
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
