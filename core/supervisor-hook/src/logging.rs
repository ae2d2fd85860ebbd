//! File logging for the hook.
//!
//! Hooks run inside the agent's own process tree, so stdout belongs to the
//! agent. Logs go to `<state_dir>/logs/hook.log` (daily rotation).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "hook.log";

pub fn init(state_dir: &Path) -> Option<WorkerGuard> {
    let log_dir = supervisor_core::logs_dir(state_dir);
    fs_err::create_dir_all(&log_dir).ok()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .ok()?;
    Some(guard)
}
