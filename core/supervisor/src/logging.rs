//! File logging for the proxy.
//!
//! The proxy owns the user's terminal in raw mode, so nothing may be printed to
//! stdout/stderr while it runs. Logs go to `<state_dir>/logs/cc-supervisor.log`
//! (daily rotation) through a non-blocking writer.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "CC_SUPERVISOR_DEBUG";
const LOG_FILE_NAME: &str = "cc-supervisor.log";

fn debug_from_env() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

/// Install the global subscriber. Hold the returned guard for the life of
/// `main`; dropping it flushes buffered lines.
pub fn init(state_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let log_dir = supervisor_core::logs_dir(state_dir);
    if let Err(err) = fs_err::create_dir_all(&log_dir) {
        eprintln!("cc-supervisor: logging disabled: {}", err);
        return None;
    }

    let filter = if verbose || debug_from_env() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    match installed {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}
