//! Socket transport for the issue channel.
//!
//! A Unix domain socket accepting newline-delimited JSON requests. Each
//! connection gets its own thread and may send any number of requests; every
//! request gets exactly one response carrying the same `id`. A malformed line
//! only produces an error response on that connection.
//!
//! The server does not touch engine state. Accepted registrations and issue
//! reports are handed to a callback as [`ChannelEvent`]s, which the proxy
//! forwards to its control loop.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use supervisor_protocol::{
    parse_register_session, parse_report_issue, parse_request, ErrorInfo, Method, Request,
    Response, ERROR_INTERNAL, ERROR_INVALID_PARAMS, ERROR_INVALID_REQUEST,
    ERROR_METHOD_NOT_FOUND, MAX_REQUEST_BYTES,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::issues::{IssueReport, IssueSource};

const READ_CHUNK_SIZE: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    SessionRegistered {
        session_id: String,
        project_path: Option<PathBuf>,
    },
    IssueReported(IssueReport),
}

/// Receives every accepted event. An `Err` becomes an internal-error response.
pub type ChannelCallback = Arc<dyn Fn(ChannelEvent) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSession {
    pub session_id: String,
    pub project_path: Option<PathBuf>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

struct SharedState {
    callback: ChannelCallback,
    // Latest registration per project; a new session replaces the old one.
    sessions: Mutex<HashMap<Option<PathBuf>, RegisteredSession>>,
    shutdown: AtomicBool,
}

pub struct RpcServer {
    path: PathBuf,
    state: Arc<SharedState>,
    accept_thread: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind `path` (replacing a stale socket file) and start accepting.
    pub fn start(path: &Path, callback: ChannelCallback) -> Result<Self> {
        prepare_socket_dir(path)?;
        remove_existing_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|source| SupervisorError::Socket {
            path: path.to_path_buf(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| SupervisorError::Socket {
                path: path.to_path_buf(),
                source,
            })?;

        let state = Arc::new(SharedState {
            callback,
            sessions: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        let accept_thread = thread::Builder::new()
            .name("rpc-accept".to_string())
            .spawn(move || accept_loop(listener, accept_state))
            .map_err(|err| SupervisorError::io("Failed to spawn socket accept thread", err))?;

        info!(path = %path.display(), "Issue channel socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            state,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recent registration for each project path.
    pub fn registered_sessions(&self) -> Vec<RegisteredSession> {
        match self.state.sessions.lock() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Stop accepting, let connection threads wind down, remove the socket file.
    pub fn shutdown(&mut self) {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        match fs_err::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "Failed to remove socket file"),
        }
        info!(path = %self.path.display(), "Issue channel socket closed");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<()> {
    match socket_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs_err::create_dir_all(parent)
            .map_err(|err| SupervisorError::io("Failed to create socket directory", err)),
        _ => Ok(()),
    }
}

fn remove_existing_socket(socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        debug!(path = %socket_path.display(), "Removing stale socket file");
        fs_err::remove_file(socket_path)
            .map_err(|err| SupervisorError::io("Failed to remove existing socket", err))?;
    }
    Ok(())
}

fn accept_loop(listener: UnixListener, state: Arc<SharedState>) {
    while !state.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                let spawned = thread::Builder::new()
                    .name("rpc-conn".to_string())
                    .spawn(move || handle_connection(stream, state));
                if let Err(err) = spawned {
                    warn!(error = %err, "Failed to spawn connection thread");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(error = %err, "Failed to accept socket connection");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    // Accepted sockets inherit non-blocking mode on some platforms.
    if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(READ_POLL)).is_err() {
        warn!("Failed to configure socket connection");
        return;
    }

    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    // Set after an oversize line: drop bytes until its newline arrives.
    let mut discarding = false;

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let n = match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "Socket connection read failed");
                return;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(index) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=index).collect();
            if discarding {
                discarding = false;
                continue;
            }
            let line = &line[..line.len() - 1];
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let response = handle_line(line, &state);
            if write_response(&mut stream, &response).is_err() {
                return;
            }
        }

        if buffer.len() > MAX_REQUEST_BYTES {
            buffer.clear();
            if !discarding {
                discarding = true;
                warn!(limit = MAX_REQUEST_BYTES, "Socket request exceeded maximum size");
                let response = Response::error(
                    None,
                    ERROR_INVALID_REQUEST,
                    "request exceeded maximum size",
                );
                if write_response(&mut stream, &response).is_err() {
                    return;
                }
            }
        }
    }
}

fn handle_line(line: &[u8], state: &SharedState) -> Response {
    if std::str::from_utf8(line).is_err() {
        return Response::error(None, ERROR_INVALID_REQUEST, "request was not valid UTF-8");
    }
    match parse_request(line) {
        Ok(request) => {
            debug!(method = %request.method, id = ?request.id, "Socket request received");
            handle_request(request, state)
        }
        Err(rejected) => {
            warn!(code = rejected.error.code, message = %rejected.error.message, "Rejected socket request");
            Response::error_with_info(rejected.id, rejected.error)
        }
    }
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    let id = request.id.clone();
    let Some(method) = request.method() else {
        return Response::error(
            id,
            ERROR_METHOD_NOT_FOUND,
            format!("unknown method: {}", request.method),
        );
    };

    let result = match method {
        Method::Ping => Ok(json!({ "success": true, "message": "pong" })),
        Method::RegisterSession => handle_register_session(request.params, state),
        Method::ReportIssue => handle_report_issue(request.params, state),
    };

    match result {
        Ok(value) => Response::ok(id, value),
        Err(error) => Response::error_with_info(id, error),
    }
}

fn handle_register_session(
    params: Option<Value>,
    state: &SharedState,
) -> std::result::Result<Value, ErrorInfo> {
    let params = parse_register_session(params)?;
    let project_path = params.project_path.map(PathBuf::from);

    let session = RegisteredSession {
        session_id: params.session_id.clone(),
        project_path: project_path.clone(),
        registered_at: chrono::Utc::now(),
    };
    match state.sessions.lock() {
        Ok(mut sessions) => sessions.insert(session.project_path.clone(), session),
        Err(poisoned) => poisoned
            .into_inner()
            .insert(session.project_path.clone(), session),
    };

    (state.callback)(ChannelEvent::SessionRegistered {
        session_id: params.session_id.clone(),
        project_path,
    })
    .map_err(|err| ErrorInfo::new(ERROR_INTERNAL, err))?;

    info!(session_id = %params.session_id, "Session registered over socket");
    Ok(json!({
        "success": true,
        "message": format!("session {} registered", params.session_id),
    }))
}

fn handle_report_issue(
    params: Option<Value>,
    state: &SharedState,
) -> std::result::Result<Value, ErrorInfo> {
    let params = parse_report_issue(params)?;
    let report = IssueReport::new(params.session_id.clone(), params.issue_body, IssueSource::Socket)
        .ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "issueBody is required"))?;

    (state.callback)(ChannelEvent::IssueReported(report))
        .map_err(|err| ErrorInfo::new(ERROR_INTERNAL, err))?;

    info!(session_id = %params.session_id, "Issue received over socket");
    Ok(json!({ "success": true, "message": "issue accepted" }))
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
