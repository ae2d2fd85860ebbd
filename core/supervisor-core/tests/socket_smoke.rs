use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use supervisor_core::{ChannelCallback, ChannelEvent, RpcServer};
use supervisor_protocol::{Method, Request, Response, ERROR_INVALID_REQUEST, MAX_REQUEST_BYTES};

struct Client {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Client {
    fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).expect("Failed to connect to socket");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        Self { stream, reader }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("Failed to write request");
        self.stream.flush().ok();
    }

    fn send(&mut self, request: &Request) -> Response {
        let mut line = serde_json::to_vec(request).expect("serialize request");
        line.push(b'\n');
        self.send_raw(&line);
        self.read_response()
    }

    fn read_response(&mut self) -> Response {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("Failed to read response");
        serde_json::from_str(&line).expect("Failed to parse response JSON")
    }
}

fn start_server(dir: &Path) -> (RpcServer, Receiver<ChannelEvent>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: ChannelCallback = Arc::new(move |event: ChannelEvent| -> Result<(), String> {
        tx.lock()
            .map_err(|_| "event channel poisoned".to_string())?
            .send(event)
            .map_err(|err| err.to_string())
    });
    let server = RpcServer::start(&dir.join("supervisor.sock"), callback).expect("start server");
    (server, rx)
}

#[test]
fn ping_round_trip() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (server, _events) = start_server(temp_dir.path());

    let mut client = Client::connect(server.path());
    let response = client.send(&Request::new(42, Method::Ping, None));
    assert!(response.is_ok());
    assert_eq!(response.id, Some(json!(42)));
    assert_eq!(response.result, Some(json!({"success": true, "message": "pong"})));
}

#[test]
fn malformed_input_on_one_connection_does_not_affect_another() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (server, events) = start_server(temp_dir.path());

    let mut noisy = Client::connect(server.path());
    let mut healthy = Client::connect(server.path());

    noisy.send_raw(b"\xff\xfe not utf8\n");
    let rejected = noisy.read_response();
    assert_eq!(rejected.error.map(|e| e.code), Some(ERROR_INVALID_REQUEST));

    let response = healthy.send(&Request::new(
        "r-1",
        Method::ReportIssue,
        Some(json!({"sessionId": "session-a", "issueBody": "TypeError: x is undefined"})),
    ));
    assert!(response.is_ok());
    assert_eq!(response.id, Some(json!("r-1")));

    // The noisy connection is still usable.
    let pong = noisy.send(&Request::new(2, Method::Ping, None));
    assert!(pong.is_ok());

    match events.recv_timeout(Duration::from_secs(2)).expect("event") {
        ChannelEvent::IssueReported(report) => {
            assert_eq!(report.session_id, "session-a");
            assert_eq!(report.body, "TypeError: x is undefined");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn oversize_request_is_rejected_and_connection_continues() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (server, _events) = start_server(temp_dir.path());

    let mut client = Client::connect(server.path());
    let mut huge = vec![b'a'; MAX_REQUEST_BYTES + 4096];
    huge.push(b'\n');
    client.send_raw(&huge);
    let rejected = client.read_response();
    assert!(!rejected.is_ok());

    let pong = client.send(&Request::new(7, Method::Ping, None));
    assert_eq!(pong.id, Some(json!(7)));
    assert!(pong.is_ok());
}

#[test]
fn concurrent_clients_each_get_their_own_response() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (server, events) = start_server(temp_dir.path());
    let socket = server.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let socket = socket.clone();
            thread::spawn(move || {
                let mut client = Client::connect(&socket);
                let response = client.send(&Request::new(
                    index,
                    Method::RegisterSession,
                    Some(json!({"sessionId": format!("session-{}", index)})),
                ));
                assert_eq!(response.id, Some(json!(index)));
                assert!(response.is_ok());
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("client thread");
    }

    let mut registered: Vec<String> = (0..8)
        .map(|_| match events.recv_timeout(Duration::from_secs(2)).expect("event") {
            ChannelEvent::SessionRegistered { session_id, .. } => session_id,
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
    registered.sort();
    assert_eq!(registered.len(), 8);
    // No project path given: all eight share one slot.
    assert_eq!(server.registered_sessions().len(), 1);
}

#[test]
fn missing_id_is_answered_with_null_id() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (server, _events) = start_server(temp_dir.path());

    let mut client = Client::connect(server.path());
    client.send_raw(b"{\"method\":\"ping\"}\n");
    let mut raw = String::new();
    client.reader.read_line(&mut raw).expect("read");
    let value: Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["id"], Value::Null);
    assert_eq!(value["result"]["message"], json!("pong"));
}
