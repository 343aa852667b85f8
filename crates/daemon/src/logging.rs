//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the filter follows the configured
//! verbosity. With a log directory configured, output is also written to a
//! daily rolling file through a non-blocking writer.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the file writer flushing; hold it until the process exits
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Default filter directives for a verbosity level
pub fn directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,fuser=warn",
        1 => "info,common=debug,matrixfs_daemon=debug,matrixfs=debug,fuser=warn",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// Fails quietly when one is already installed so tests and embedders can
/// set their own.
pub fn init(verbosity: u8, log_dir: Option<&Path>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(verbosity)));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "matrixfs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    if result.is_err() {
        tracing::debug!("a tracing subscriber was already installed");
    }

    if let Some(dir) = log_dir {
        tracing::info!("logging to {}", dir.display());
    }
    LogGuard { _file: guard }
}
