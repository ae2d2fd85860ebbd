//! Client for the supervisor's issue socket.
//!
//! Every call is one connection, one request line, one response line. The
//! supervisor may not be running; callers decide what a failure means.

use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use supervisor_protocol::{Method, Request, Response, MAX_REQUEST_BYTES};

const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn register_session(
    socket: &Path,
    session_id: &str,
    project_path: Option<&str>,
) -> Result<(), String> {
    let mut params = json!({ "sessionId": session_id });
    if let (Some(path), Some(object)) = (project_path, params.as_object_mut()) {
        object.insert("projectPath".to_string(), Value::String(path.to_string()));
    }
    call_with_retry(socket, Method::RegisterSession, Some(params), "registerSession").map(|_| ())
}

pub fn report_issue(socket: &Path, session_id: &str, issue_body: &str) -> Result<(), String> {
    let params = json!({
        "sessionId": session_id,
        "issueBody": issue_body,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    call_with_retry(socket, Method::ReportIssue, Some(params), "reportIssue").map(|_| ())
}

pub fn ping(socket: &Path) -> Result<bool, String> {
    let result = call(socket, Method::Ping, None)?;
    Ok(result.get("message").and_then(Value::as_str) == Some("pong"))
}

fn call_with_retry(
    socket: &Path,
    method: Method,
    params: Option<Value>,
    label: &str,
) -> Result<Value, String> {
    match call(socket, method, params.clone()) {
        Ok(result) => Ok(result),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to supervisor", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            call(socket, method, params).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, "Retry failed sending {} to supervisor", label);
                retry_err
            })
        }
    }
}

fn call(socket: &Path, method: Method, params: Option<Value>) -> Result<Value, String> {
    let id = format!("hook-{}-{}", std::process::id(), chrono::Utc::now().timestamp_millis());
    let response = send_request(socket, &Request::new(id, method, params))?;
    match (response.result, response.error) {
        (_, Some(err)) => Err(format!("{}: {}", err.code, err.message)),
        (Some(result), None) => Ok(result),
        (None, None) => Err("Supervisor response had neither result nor error".to_string()),
    }
}

fn send_request(socket: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to supervisor socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for supervisor response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err("Supervisor response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn serve<F>(listener: UnixListener, connections: usize, reply: F) -> thread::JoinHandle<Vec<Value>>
    where
        F: Fn(usize, &Value) -> Option<String> + Send + 'static,
    {
        thread::spawn(move || {
            let mut seen = Vec::new();
            for index in 0..connections {
                let (stream, _) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut line = String::new();
                reader.read_line(&mut line).expect("read request");
                let request: Value = serde_json::from_str(&line).expect("request json");
                if let Some(mut response) = reply(index, &request) {
                    response.push('\n');
                    let mut stream = stream;
                    stream.write_all(response.as_bytes()).expect("write response");
                }
                seen.push(request);
            }
            seen
        })
    }

    #[test]
    fn report_issue_sends_camel_case_params() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("s.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = serve(listener, 1, |_, request| {
            Some(json!({"id": request["id"], "result": {"success": true}}).to_string())
        });

        report_issue(&socket, "session-a", "lint failed").expect("report");
        let requests = server.join().expect("server");
        assert_eq!(requests[0]["method"], json!("reportIssue"));
        assert_eq!(requests[0]["params"]["sessionId"], json!("session-a"));
        assert_eq!(requests[0]["params"]["issueBody"], json!("lint failed"));
    }

    #[test]
    fn error_response_is_retried_once_then_surfaced() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("s.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let server = serve(listener, 2, move |_, request| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(
                json!({"id": request["id"], "error": {"code": -32602, "message": "nope"}})
                    .to_string(),
            )
        });

        let err = register_session(&socket, "session-a", None).expect_err("should fail");
        server.join().expect("server");
        assert!(err.contains("-32602"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ping_recognizes_pong() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("s.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = serve(listener, 1, |_, request| {
            Some(json!({"id": request["id"], "result": {"success": true, "message": "pong"}}).to_string())
        });
        assert!(ping(&socket).expect("ping"));
        server.join().expect("server");
    }

    #[test]
    fn missing_socket_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(ping(&temp_dir.path().join("absent.sock")).is_err());
    }
}
