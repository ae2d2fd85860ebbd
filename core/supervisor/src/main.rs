//! cc-supervisor: transparent terminal proxy for an interactive coding agent.
//!
//! Runs the agent inside a pseudo-terminal, relays all I/O untouched, and
//! injects a follow-up instruction whenever an external verifier reports a
//! problem for the active session.
//!
//! Everything after the supervisor's own flags is passed to the agent:
//!
//! ```text
//! cc-supervisor --session 5f0c7a2e-... -- --model opus
//! ```

mod logging;
mod proxy;
mod terminal;

use clap::Parser;
use std::path::PathBuf;
use supervisor_core::{load_config, state_dir, SupervisorConfig, CONFIG_FILE_NAME};
use tracing::{error, info, warn};

use proxy::ProxyOptions;

#[derive(Parser)]
#[command(name = "cc-supervisor")]
#[command(about = "Supervise an interactive coding agent and auto-inject fixes for reported issues")]
#[command(version)]
#[command(after_help = "Files:\n  \
    ~/.cc-supervisor/config.toml\n  \
    ~/.cc-supervisor/projects/<project-name>/active-session\n  \
    ~/.cc-supervisor/projects/<project-name>/<session-id>.issues\n  \
    ~/.cc-supervisor/projects/<project-name>/<session-id>.history.json\n  \
    ~/.cc-supervisor/logs/cc-supervisor.log\n\n\
Environment:\n  \
    CC_SUPERVISOR_HOME     state directory (default ~/.cc-supervisor)\n  \
    CC_SUPERVISOR_SOCKET   issue socket path\n  \
    CC_SUPERVISOR_DEBUG=1  debug logging")]
struct Cli {
    /// Bind to this session id instead of detecting it
    #[arg(long, value_name = "ID")]
    session: Option<String>,

    /// Verbose diagnostics in the log file
    #[arg(short, long, visible_alias = "debug")]
    verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, value_name = "PATH")]
    project: Option<PathBuf>,

    /// Program to supervise (overrides child_command from config.toml)
    #[arg(long, value_name = "PROGRAM")]
    command: Option<String>,

    /// Do not listen on the issue socket
    #[arg(long)]
    no_socket: bool,

    /// Arguments passed through to the supervised program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    child_args: Vec<String>,
}

fn main() {
    // `run` owns the log guard, so buffered lines are flushed before exit.
    std::process::exit(run(Cli::parse()));
}

fn run(cli: Cli) -> i32 {
    let state_dir = match state_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("cc-supervisor: {}", err);
            return 1;
        }
    };
    let _logging_guard = logging::init(&state_dir, cli.verbose);

    let config = match load_config(&state_dir.join(CONFIG_FILE_NAME)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            eprintln!("cc-supervisor: {} (using defaults)", err);
            SupervisorConfig::default()
        }
    };

    let project_path = match resolve_project_path(cli.project) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Invalid project directory");
            eprintln!("cc-supervisor: {}", err);
            return 1;
        }
    };

    let program = cli.command.unwrap_or_else(|| config.child_command.clone());
    info!(
        program = %program,
        project = %project_path.display(),
        pinned = cli.session.is_some(),
        "cc-supervisor starting"
    );

    let options = ProxyOptions {
        config,
        state_dir,
        project_path,
        program,
        args: cli.child_args,
        pinned_session: cli.session,
        socket: !cli.no_socket,
    };

    match proxy::run(options) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "cc-supervisor failed");
            eprintln!("cc-supervisor: {}", err);
            1
        }
    }
}

fn resolve_project_path(project: Option<PathBuf>) -> Result<PathBuf, String> {
    let path = match project {
        Some(path) => path,
        None => std::env::current_dir()
            .map_err(|err| format!("Failed to read current directory: {}", err))?,
    };
    fs_err::canonicalize(&path).map_err(|err| format!("Invalid project directory: {}", err))
}
