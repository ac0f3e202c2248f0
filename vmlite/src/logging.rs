//! Tracing subscriber setup.
//!
//! Logs go to stderr and to a daily-rolling file under the given directory.
//! The filter comes from `RUST_LOG` and defaults to `info`.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vmlite_shared::errors::{VmliteError, VmliteResult};

/// Keeps the file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber, writing `vmlite.log.<date>` into `log_dir`.
///
/// Later calls are no-ops.
pub fn init_logging_for(log_dir: &Path) -> VmliteResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(log_dir).map_err(|e| {
        VmliteError::Storage(format!(
            "Failed to create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "vmlite.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init();

    // Another subscriber (e.g. a test harness) already owns the global slot.
    if installed.is_ok() {
        let _ = LOG_GUARD.set(guard);
    }

    Ok(())
}
