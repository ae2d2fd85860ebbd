//! The running proxy: PTY, I/O pumps and the control loop.
//!
//! ```text
//!  pty reader ─┐
//!  stdin ──────┤
//!  signals ────┼──▶ mpsc ──▶ control loop ──▶ Engine ──▶ pty writer / stdout
//!  child wait ─┤                  │
//!  socket ─────┤                  └──▶ verifier thread ──┐
//!  verifier ◀──┴─────────────────────────────────────────┘
//! ```
//!
//! Every source runs on its own thread and only sends events. The control
//! loop is the single owner of `Engine`, the PTY master and the child killer.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGWINCH};
use signal_hook::iterator::Signals;
use std::io::{self, Read, Stdout};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use supervisor_core::config::SOCKET_ENV;
use supervisor_core::verifier::{PROJECT_ROOT_ENV, SESSION_ID_ENV};
use supervisor_core::{
    ChannelCallback, ChannelEvent, CommandVerifier, Engine, HeuristicClassifier,
    InputDisposition, ProjectPaths, RpcServer, SupervisorConfig, SupervisorError,
    VerificationOutcome, Verifier,
};
use tracing::{debug, error, info, warn};

use crate::terminal::{self, TerminalGuard};

/// Shortest control-loop sleep, so a deadline already in the past cannot spin.
const MIN_WAIT: Duration = Duration::from_millis(5);
const READ_CHUNK_SIZE: usize = 8192;
/// How long to keep relaying output after the child has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(500);
/// How long to wait for the child after asking it to stop.
const KILL_GRACE: Duration = Duration::from_secs(2);
const ISSUES_FILE_ENV: &str = "CC_SUPERVISOR_ISSUES_FILE";

pub struct ProxyOptions {
    pub config: SupervisorConfig,
    pub state_dir: PathBuf,
    pub project_path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub pinned_session: Option<String>,
    pub socket: bool,
}

enum Event {
    Output(Vec<u8>),
    OutputClosed,
    Input(Vec<u8>),
    Resize,
    Terminate(i32),
    ChildExited(u32),
    Channel(ChannelEvent),
    Verified {
        session_id: String,
        outcome: VerificationOutcome,
    },
}

type ChildWriter = Box<dyn io::Write + Send>;

struct Pty {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: ChildWriter,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

fn spawn_child(options: &ProxyOptions, paths: &ProjectPaths) -> Result<Pty, SupervisorError> {
    let (cols, rows) = terminal::size();
    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| SupervisorError::Pty(err.to_string()))?;

    let mut command = CommandBuilder::new(&options.program);
    command.args(&options.args);
    command.cwd(&options.project_path);
    if std::env::var_os("TERM").is_none() {
        command.env("TERM", "xterm-256color");
    }
    // Lets hooks and verifiers launched by the child find this supervisor.
    command.env(PROJECT_ROOT_ENV, &options.project_path);
    command.env(SOCKET_ENV, options.config.resolved_socket_path());
    if let Some(session_id) = &options.pinned_session {
        command.env(SESSION_ID_ENV, session_id);
        command.env(ISSUES_FILE_ENV, paths.issues_file(session_id));
    }

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|err| SupervisorError::SpawnFailed {
            command: options.program.clone(),
            details: err.to_string(),
            remediation: spawn_remediation(&options.program),
        })?;
    // The slave end belongs to the child now; keeping it open would hide EOF.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| SupervisorError::Pty(err.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| SupervisorError::Pty(err.to_string()))?;

    Ok(Pty {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

fn spawn_remediation(program: &str) -> String {
    if program == "claude" {
        "Install the agent CLI (npm install -g @anthropic-ai/claude-code) and make sure `claude` is on PATH, or set child_command in config.toml".to_string()
    } else {
        format!(
            "Make sure `{}` is installed and on PATH, or set child_command in config.toml",
            program
        )
    }
}

/// Run the child under supervision until it exits or the user stops it.
/// Returns the exit code to hand back to the shell.
pub fn run(options: ProxyOptions) -> Result<i32, SupervisorError> {
    let paths = ProjectPaths::new(&options.state_dir, &options.project_path)?;
    let pty = spawn_child(&options, &paths)?;
    info!(
        program = %options.program,
        args = ?options.args,
        project = %options.project_path.display(),
        "Child started"
    );

    let (tx, rx) = mpsc::channel::<Event>();
    let Pty {
        master,
        reader,
        writer,
        child,
    } = pty;

    // The waiter thread owns the child; the control loop keeps only a killer.
    let mut killer = child.clone_killer();
    spawn_output_pump(reader, tx.clone());
    spawn_input_pump(tx.clone());
    spawn_child_waiter(child, tx.clone());
    let signals = spawn_signal_pump(tx.clone());

    let mut server = if options.socket {
        start_socket(&options.config, tx.clone())
    } else {
        None
    };

    let verifier: Option<Arc<dyn Verifier>> = CommandVerifier::from_config(&options.config.verifier)
        .map(|verifier| Arc::new(verifier) as Arc<dyn Verifier>);

    let guard = TerminalGuard::acquire();
    let now = Instant::now();
    let mut engine: Engine<ChildWriter, Stdout> = Engine::new(
        options.config.clone(),
        paths,
        Box::new(HeuristicClassifier::from_config(&options.config)),
        writer,
        io::stdout(),
        now,
    );
    if let Err(err) = engine.start(options.pinned_session.as_deref(), now) {
        let _ = killer.kill();
        drop(guard);
        return Err(err);
    }

    let mut control = ControlLoop {
        engine,
        master,
        killer,
        verifier,
        tx,
    };
    let exit_code = control.run(&rx);

    if let Some(server) = server.as_mut() {
        server.shutdown();
    }
    if let Some(handle) = signals {
        handle.close();
    }
    drop(guard);
    info!(exit_code, "Supervision ended");
    Ok(exit_code)
}

struct ControlLoop {
    engine: Engine<ChildWriter, Stdout>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    verifier: Option<Arc<dyn Verifier>>,
    tx: Sender<Event>,
}

impl ControlLoop {
    fn run(&mut self, rx: &Receiver<Event>) -> i32 {
        let mut exit_code: Option<i32> = None;
        let mut drain_until: Option<Instant> = None;
        let mut output_closed = false;
        let mut stop_requested: Option<i32> = None;

        loop {
            match rx.recv_timeout(self.wait_budget(drain_until, Instant::now())) {
                Ok(event) => match event {
                    Event::Output(bytes) => {
                        if let Err(err) = self.engine.on_child_output(&bytes, Instant::now()) {
                            error!(error = %err, "Terminal write failed; stopping");
                            stop_requested.get_or_insert(1);
                        }
                    }
                    Event::OutputClosed => output_closed = true,
                    Event::Input(bytes) => match self.engine.on_user_input(&bytes, Instant::now()) {
                        Ok(InputDisposition::Shutdown) => {
                            stop_requested.get_or_insert(130);
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Failed to forward input"),
                    },
                    Event::Resize => self.resize(),
                    Event::Terminate(signal) => {
                        info!(signal, "Termination signal received");
                        stop_requested.get_or_insert(128 + signal);
                    }
                    Event::ChildExited(code) => {
                        info!(code, "Child exited");
                        self.engine.on_child_exit();
                        exit_code = Some(code as i32);
                        drain_until = Some(Instant::now() + EXIT_DRAIN);
                    }
                    Event::Channel(event) => {
                        if let Err(err) = self.engine.on_channel_event(event, Instant::now()) {
                            warn!(error = %err, "Failed to handle channel event");
                        }
                    }
                    Event::Verified {
                        session_id,
                        outcome,
                    } => {
                        if let Err(err) =
                            self.engine
                                .on_verification_result(&session_id, outcome, Instant::now())
                        {
                            warn!(error = %err, "Failed to act on verification result");
                        }
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if let Some(code) = exit_code {
                if output_closed || drain_until.is_some_and(|deadline| now >= deadline) {
                    self.finish(now);
                    return code;
                }
                continue;
            }

            if let Some(code) = stop_requested.take() {
                self.finish(now);
                return self.stop_child(rx).unwrap_or(code);
            }

            if let Err(err) = self.engine.tick(now) {
                warn!(error = %err, "Supervision tick failed");
            }
            self.dispatch_verification(now);
        }

        self.finish(Instant::now());
        exit_code.unwrap_or(1)
    }

    /// Sleep until the next engine deadline (or the end of the exit drain),
    /// never longer than the idle check interval.
    fn wait_budget(&self, drain_until: Option<Instant>, now: Instant) -> Duration {
        wait_budget(
            self.engine.config().idle_check_interval(),
            self.engine.next_deadline().or(drain_until),
            now,
        )
    }

    fn resize(&mut self) {
        let (cols, rows) = terminal::size();
        debug!(cols, rows, "Terminal resized");
        if let Err(err) = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            warn!(error = %err, "Failed to resize PTY");
        }
    }

    fn dispatch_verification(&mut self, now: Instant) {
        let Some(verifier) = self.verifier.clone() else {
            return;
        };
        let Some(request) = self.engine.take_verification_request(now) else {
            return;
        };
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("verifier".to_string())
            .spawn(move || {
                let outcome = verifier.verify(&request);
                let _ = tx.send(Event::Verified {
                    session_id: request.session_id,
                    outcome,
                });
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn verifier thread");
            let _ = self.tx.send(Event::Verified {
                session_id: String::new(),
                outcome: VerificationOutcome::Inconclusive {
                    reason: err.to_string(),
                },
            });
        }
    }

    fn finish(&mut self, now: Instant) {
        if let Err(err) = self.engine.shutdown(now) {
            warn!(error = %err, "Failed to persist fix history at shutdown");
        }
    }

    /// Ask the child to stop and wait briefly for its exit code.
    fn stop_child(&mut self, rx: &Receiver<Event>) -> Option<i32> {
        if let Err(err) = self.killer.kill() {
            debug!(error = %err, "Child kill failed (already gone?)");
        }
        let deadline = Instant::now() + KILL_GRACE;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(Event::ChildExited(code)) => return Some(code as i32),
                Ok(Event::Output(bytes)) => {
                    let _ = self.engine.on_child_output(&bytes, Instant::now());
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }
}

fn spawn_output_pump(mut reader: Box<dyn Read + Send>, tx: Sender<Event>) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Event::Output(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // EIO is how Linux reports the slave side closing.
                    debug!(error = %err, "PTY read ended");
                    break;
                }
            }
        }
        let _ = tx.send(Event::OutputClosed);
    });
}

fn spawn_input_pump(tx: Sender<Event>) {
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if tx.send(Event::Input(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(error = %err, "Stdin read ended");
                    return;
                }
            }
        }
    });
}

fn spawn_child_waiter(mut child: Box<dyn portable_pty::Child + Send + Sync>, tx: Sender<Event>) {
    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code(),
            Err(err) => {
                warn!(error = %err, "Failed to wait for child");
                1
            }
        };
        let _ = tx.send(Event::ChildExited(code));
    });
}

fn spawn_signal_pump(tx: Sender<Event>) -> Option<signal_hook::iterator::Handle> {
    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP, SIGWINCH]) {
        Ok(signals) => signals,
        Err(err) => {
            warn!(error = %err, "Failed to install signal handlers");
            return None;
        }
    };
    let handle = signals.handle();
    thread::spawn(move || {
        for signal in signals.forever() {
            let event = match signal {
                SIGWINCH => Event::Resize,
                other => Event::Terminate(other),
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    });
    Some(handle)
}

fn start_socket(config: &SupervisorConfig, tx: Sender<Event>) -> Option<RpcServer> {
    let tx = Mutex::new(tx);
    let callback: ChannelCallback = Arc::new(move |event: ChannelEvent| -> Result<(), String> {
        tx.lock()
            .map_err(|_| "event channel poisoned".to_string())?
            .send(Event::Channel(event))
            .map_err(|_| "supervisor is shutting down".to_string())
    });
    let path = config.resolved_socket_path();
    match RpcServer::start(&path, callback) {
        Ok(server) => Some(server),
        Err(err) => {
            // The file transport still works without the socket.
            warn!(error = %err, path = %path.display(), "Issue socket unavailable");
            None
        }
    }
}

fn wait_budget(interval: Duration, deadline: Option<Instant>, now: Instant) -> Duration {
    let until_deadline = deadline
        .map(|deadline| deadline.saturating_duration_since(now))
        .unwrap_or(interval);
    until_deadline.min(interval).max(MIN_WAIT)
}
