//! External verifier contract.
//!
//! When the child claims to be finished, the engine asks a verifier whether
//! the project really is in a good state. The verifier is a collaborator: it
//! receives the project root and the recent output, and answers
//! `{"success": bool, "response": "..."}`. A verifier that takes too long is
//! treated as a pass so the user is never blocked on it.

use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::VerifierConfig;

pub const PROJECT_ROOT_ENV: &str = "CC_SUPERVISOR_PROJECT_ROOT";
pub const SESSION_ID_ENV: &str = "CC_SUPERVISOR_SESSION_ID";

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything a verifier gets to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub session_id: String,
    pub project_root: PathBuf,
    pub recent_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Passed,
    Failed { response: String },
    Inconclusive { reason: String },
}

pub trait Verifier: Send + Sync {
    fn verify(&self, request: &VerificationRequest) -> VerificationOutcome;
}

#[derive(Debug, Deserialize)]
struct VerifierReply {
    success: bool,
    #[serde(default)]
    response: String,
}

/// Runs a configured program per verification.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    pub fn from_config(config: &VerifierConfig) -> Option<Self> {
        if !config.enabled() {
            return None;
        }
        Self::new(&config.command, config.timeout())
    }
}

impl Verifier for CommandVerifier {
    fn verify(&self, request: &VerificationRequest) -> VerificationOutcome {
        let started = Instant::now();
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.project_root)
            .env(PROJECT_ROOT_ENV, &request.project_root)
            .env(SESSION_ID_ENV, &request.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %self.program, error = %err, "Failed to start verifier");
                return VerificationOutcome::Inconclusive {
                    reason: format!("failed to start {}: {}", self.program, err),
                };
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // A verifier that ignores its stdin closes the pipe early; that is fine.
            if let Err(err) = stdin.write_all(request.recent_context.as_bytes()) {
                debug!(error = %err, "Verifier did not take the full context");
            }
        }

        // Drain stdout concurrently so a chatty verifier cannot fill the pipe and stall.
        let (tx, rx) = mpsc::channel();
        if let Some(mut stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf);
                let _ = tx.send(buf);
            });
        }

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    info!(
                        program = %self.program,
                        timeout_secs = self.timeout.as_secs(),
                        "Verifier timed out; treating as passed"
                    );
                    return VerificationOutcome::Passed;
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(err) => {
                    let _ = child.kill();
                    return VerificationOutcome::Inconclusive {
                        reason: format!("failed to wait for verifier: {}", err),
                    };
                }
            }
        };

        let stdout = rx.recv_timeout(Duration::from_secs(1)).unwrap_or_default();
        let outcome = interpret_reply(&stdout);
        debug!(
            program = %self.program,
            status = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Verifier finished"
        );
        outcome
    }
}

/// Map verifier stdout to an outcome. The reply is the last JSON object line,
/// so verifiers may print progress before it.
pub fn interpret_reply(stdout: &[u8]) -> VerificationOutcome {
    let text = String::from_utf8_lossy(stdout);
    let reply = text
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<VerifierReply>(line).ok());

    match reply {
        Some(reply) if reply.success => VerificationOutcome::Passed,
        Some(reply) if reply.response.trim().is_empty() => VerificationOutcome::Inconclusive {
            reason: "verifier failed without a response".to_string(),
        },
        Some(reply) => VerificationOutcome::Failed {
            response: reply.response,
        },
        None => VerificationOutcome::Inconclusive {
            reason: "verifier produced no JSON reply".to_string(),
        },
    }
}
