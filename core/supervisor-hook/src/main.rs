//! cc-supervisor-hook: lifecycle hook and reporting helper for cc-supervisor.
//!
//! ## Subcommands
//!
//! - `session-start`: agent SessionStart hook; reads the hook JSON from stdin
//!   and records the session as the project's active one
//! - `report`: reads an issue body from stdin and delivers it to the
//!   supervisor (socket first, issue file as fallback)
//! - `ping`: exits 0 when a supervisor answers on the socket

mod client;
mod logging;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use supervisor_core::{load_config, state_dir, ProjectPaths, SessionRegistry, CONFIG_FILE_NAME};
use supervisor_core::verifier::{PROJECT_ROOT_ENV, SESSION_ID_ENV};
use supervisor_protocol::validate_session_id;

#[derive(Parser)]
#[command(name = "cc-supervisor-hook")]
#[command(about = "Session registration and issue reporting for cc-supervisor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a new agent session (reads hook JSON from stdin)
    SessionStart {
        /// Project directory (defaults to the hook's cwd)
        #[arg(long, value_name = "PATH")]
        project: Option<PathBuf>,
    },

    /// Report an issue for a session (reads the issue text from stdin)
    Report {
        /// Target session (defaults to $CC_SUPERVISOR_SESSION_ID, then the registry)
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Project directory (defaults to $CC_SUPERVISOR_PROJECT_ROOT, then the cwd)
        #[arg(long, value_name = "PATH")]
        project: Option<PathBuf>,
    },

    /// Check whether a supervisor is listening
    Ping,
}

#[derive(Debug, Deserialize)]
struct HookInput {
    session_id: Option<String>,
    cwd: Option<String>,
}

struct Context {
    state_dir: PathBuf,
    socket: PathBuf,
}

fn main() {
    // `run` owns the log guard, so buffered lines are flushed before exit.
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    let state_dir = match state_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("cc-supervisor-hook: {}", err);
            return 1;
        }
    };
    let _logging_guard = logging::init(&state_dir);

    let config = load_config(&state_dir.join(CONFIG_FILE_NAME)).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Failed to load config; using defaults");
        Default::default()
    });
    let context = Context {
        socket: config.resolved_socket_path(),
        state_dir,
    };

    let result = match cli.command {
        Commands::SessionStart { project } => read_stdin().and_then(|input| {
            session_start(&context, &input, project.as_deref())
        }),
        Commands::Report { session, project } => read_stdin().and_then(|body| {
            report(&context, &body, session.as_deref(), project.as_deref())
        }),
        Commands::Ping => match client::ping(&context.socket) {
            Ok(true) => Ok(()),
            Ok(false) => Err("Unexpected ping reply".to_string()),
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "cc-supervisor-hook failed");
            eprintln!("cc-supervisor-hook: {}", err);
            1
        }
    }
}

fn read_stdin() -> Result<String, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| format!("Failed to read stdin: {}", err))?;
    Ok(input)
}

fn session_start(context: &Context, input: &str, project: Option<&Path>) -> Result<(), String> {
    let hook: HookInput =
        serde_json::from_str(input).map_err(|err| format!("Invalid hook input: {}", err))?;
    let session_id = hook
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| "Hook input has no session_id".to_string())?;
    validate_session_id(&session_id).map_err(|err| err.message)?;

    let project_path = resolve_project(project, hook.cwd.as_deref())?;
    let paths = ProjectPaths::new(&context.state_dir, &project_path).map_err(|e| e.to_string())?;
    SessionRegistry::new(paths.registry_file())
        .write(&session_id)
        .map_err(|e| e.to_string())?;
    tracing::info!(
        session_id = %session_id,
        project = %project_path.display(),
        "Session registered"
    );

    // The registry file is authoritative; the socket only shortens the
    // supervisor's reaction time.
    let project_arg = project_path.to_string_lossy();
    let registered =
        client::register_session(&context.socket, &session_id, Some(project_arg.as_ref()));
    if let Err(err) = registered {
        tracing::debug!(error = %err, "Supervisor not reachable for registerSession");
    }
    Ok(())
}

fn report(
    context: &Context,
    body: &str,
    session: Option<&str>,
    project: Option<&Path>,
) -> Result<(), String> {
    if body.trim().is_empty() {
        return Err("Issue body is empty".to_string());
    }
    let project_hint = std::env::var(PROJECT_ROOT_ENV).ok();
    let project_path = resolve_project(project, project_hint.as_deref())?;
    let paths = ProjectPaths::new(&context.state_dir, &project_path).map_err(|e| e.to_string())?;

    let session_id = match session
        .map(str::to_string)
        .or_else(|| std::env::var(SESSION_ID_ENV).ok().filter(|id| !id.trim().is_empty()))
    {
        Some(id) => id,
        None => SessionRegistry::new(paths.registry_file())
            .read()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "No session given and no active session registered".to_string())?,
    };
    validate_session_id(&session_id).map_err(|err| err.message)?;

    match client::report_issue(&context.socket, &session_id, body) {
        Ok(()) => {
            tracing::info!(session_id = %session_id, "Issue delivered over socket");
            Ok(())
        }
        Err(err) => {
            tracing::info!(error = %err, session_id = %session_id, "Socket delivery failed; writing issue file");
            write_issue_file(&paths.issues_file(&session_id), body)
        }
    }
}

/// Adds `body` to a pending issue file. A report still waiting to be picked
/// up is kept ahead of the new one.
fn write_issue_file(path: &Path, body: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let pending = match fs_err::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.to_string()),
    };
    let content = if pending.trim().is_empty() {
        body.to_string()
    } else {
        format!("{}\n\n{}", pending.trim_end(), body)
    };

    let tmp_path = path.with_extension("issues.tmp");
    fs_err::write(&tmp_path, content).map_err(|err| err.to_string())?;
    fs_err::rename(&tmp_path, path).map_err(|err| err.to_string())?;
    tracing::info!(path = %path.display(), "Issue file written");
    Ok(())
}

fn resolve_project(explicit: Option<&Path>, hint: Option<&str>) -> Result<PathBuf, String> {
    let path = match (explicit, hint.filter(|h| !h.trim().is_empty())) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(hint)) => PathBuf::from(hint),
        (None, None) => std::env::current_dir()
            .map_err(|err| format!("Failed to read current directory: {}", err))?,
    };
    fs_err::canonicalize(&path).map_err(|err| format!("Invalid project directory: {}", err))
}
