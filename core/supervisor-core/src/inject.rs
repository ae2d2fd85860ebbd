//! Command injection into the child's input.
//!
//! ```text
//! Ready ── begin ──▶ Typed ── settle elapsed ──▶ Submitted ── cooldown elapsed ──▶ Ready
//!                    (text written,             (CR written as its              (queued user
//!                     echoed to user)             own write)                      input replayed)
//! ```
//!
//! While not `Ready`, user keystrokes are queued instead of forwarded and are
//! replayed in arrival order when the cooldown ends. The agent's input box does
//! not take multi-line paste reliably, so every instruction is flattened to a
//! single line first.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, SupervisorError};

const SUBMIT: &[u8] = b"\r";
const CODE_BLOCK_PLACEHOLDER: &str = "[code block]";
const ECHO_PREFIX: &str = "\x1b[36m[auto-inject]\x1b[0m ";

static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Collapse fenced code blocks to a placeholder and all whitespace runs
/// (line breaks included) to single spaces.
pub fn flatten(text: &str) -> String {
    let without_code = RE_CODE_FENCE.replace_all(text, CODE_BLOCK_PLACEHOLDER);
    RE_WHITESPACE
        .replace_all(&without_code, " ")
        .trim()
        .to_string()
}

/// Marker + flattened instruction, ready to type.
pub fn prepare_line(marker: &str, instruction: &str) -> String {
    let marked = if marker.trim().is_empty() {
        instruction.to_string()
    } else {
        format!("{} {}", marker.trim(), instruction)
    };
    flatten(&marked)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Ready,
    Typed { since: Instant },
    Submitted { since: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionProgress {
    Submitted,
    Completed { replayed: usize },
}

#[derive(Debug)]
pub struct CommandInjector {
    marker: String,
    settle: Duration,
    cooldown: Duration,
    phase: Phase,
    queued_input: VecDeque<Vec<u8>>,
}

impl CommandInjector {
    pub fn new(marker: impl Into<String>, settle: Duration, cooldown: Duration) -> Self {
        Self {
            marker: marker.into(),
            settle,
            cooldown,
            phase: Phase::Ready,
            queued_input: VecDeque::new(),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.phase != Phase::Ready
    }

    pub fn queued_input(&self) -> &VecDeque<Vec<u8>> {
        &self.queued_input
    }

    /// Hold user input until the injection completes.
    pub fn queue_input(&mut self, bytes: &[u8]) {
        debug!(bytes = bytes.len(), "User input queued during injection");
        self.queued_input.push_back(bytes.to_vec());
    }

    /// Type the instruction into the child and echo it to the user.
    pub fn begin<C: Write, T: Write>(
        &mut self,
        instruction: &str,
        now: Instant,
        child: &mut C,
        terminal: &mut T,
    ) -> Result<String> {
        let line = prepare_line(&self.marker, instruction);
        info!(chars = line.chars().count(), "Injecting remediation instruction");

        self.phase = Phase::Typed { since: now };
        write_child(child, line.as_bytes())?;

        // The echo is informational; a broken terminal must not abort the injection.
        let _ = terminal
            .write_all(format!("{}{}", ECHO_PREFIX, line).as_bytes())
            .and_then(|_| terminal.flush());
        Ok(line)
    }

    /// Advance timers. Call on every loop iteration.
    pub fn poll<C: Write, T: Write>(
        &mut self,
        now: Instant,
        child: &mut C,
        terminal: &mut T,
    ) -> Result<Option<InjectionProgress>> {
        match self.phase {
            Phase::Ready => Ok(None),
            Phase::Typed { since } => {
                if now.saturating_duration_since(since) < self.settle {
                    return Ok(None);
                }
                self.phase = Phase::Submitted { since: now };
                write_child(child, SUBMIT)?;
                let _ = terminal.write_all(b"\r\n").and_then(|_| terminal.flush());
                debug!("Injected instruction submitted");
                Ok(Some(InjectionProgress::Submitted))
            }
            Phase::Submitted { since } => {
                if now.saturating_duration_since(since) < self.cooldown {
                    return Ok(None);
                }
                self.phase = Phase::Ready;
                let replayed = self.replay_queued(child)?;
                info!(replayed, "Injection complete");
                Ok(Some(InjectionProgress::Completed { replayed }))
            }
        }
    }

    /// Next instant at which `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Ready => None,
            Phase::Typed { since } => Some(since + self.settle),
            Phase::Submitted { since } => Some(since + self.cooldown),
        }
    }

    /// Drop any in-flight injection and queued input (child is gone).
    pub fn abort(&mut self) {
        self.phase = Phase::Ready;
        self.queued_input.clear();
    }

    fn replay_queued<C: Write>(&mut self, child: &mut C) -> Result<usize> {
        let mut replayed = 0;
        while let Some(chunk) = self.queued_input.pop_front() {
            if let Err(err) = write_child(child, &chunk) {
                // Keep what was not delivered, in order.
                self.queued_input.push_front(chunk);
                return Err(err);
            }
            replayed += 1;
        }
        Ok(replayed)
    }
}

fn write_child<C: Write>(child: &mut C, bytes: &[u8]) -> Result<()> {
    child
        .write_all(bytes)
        .and_then(|_| child.flush())
        .map_err(|err| SupervisorError::io("Failed to write to child input", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records each flushed write as a separate entry.
    #[derive(Default)]
    struct Writes {
        pending: Vec<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl Write for Writes {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if !self.pending.is_empty() {
                self.writes.push(std::mem::take(&mut self.pending));
            }
            Ok(())
        }
    }

    fn injector() -> CommandInjector {
        CommandInjector::new(
            "[🤖 auto-fix]",
            Duration::from_millis(200),
            Duration::from_millis(3000),
        )
    }

    #[test]
    fn flatten_collapses_lines_and_code() {
        let text = "Fix this:\n\n```js\nconst a = (\n```\n  then   rerun\ttests\n";
        assert_eq!(flatten(text), "Fix this: [code block] then rerun tests");
    }

    #[test]
    fn prepare_line_adds_marker() {
        assert_eq!(
            prepare_line("[🤖 auto-fix]", "line one\nline two"),
            "[🤖 auto-fix] line one line two"
        );
        assert_eq!(prepare_line("", "x"), "x");
    }

    #[test]
    fn text_and_submit_are_separate_writes() {
        let now = Instant::now();
        let mut injector = injector();
        let mut child = Writes::default();
        let mut terminal = Vec::new();

        let line = injector
            .begin("SyntaxError:\nmissing )", now, &mut child, &mut terminal)
            .expect("begin");
        assert_eq!(line, "[🤖 auto-fix] SyntaxError: missing )");
        assert!(injector.in_flight());
        assert_eq!(child.writes, vec![line.as_bytes().to_vec()]);

        assert_eq!(
            injector
                .poll(now + Duration::from_millis(100), &mut child, &mut terminal)
                .expect("poll"),
            None
        );
        assert_eq!(
            injector
                .poll(now + Duration::from_millis(200), &mut child, &mut terminal)
                .expect("poll"),
            Some(InjectionProgress::Submitted)
        );
        assert_eq!(child.writes.len(), 2);
        assert_eq!(child.writes[1], b"\r".to_vec());

        let echoed = String::from_utf8(terminal).expect("utf8");
        assert!(echoed.contains("[auto-inject]"));
        assert!(echoed.contains("SyntaxError: missing )"));
    }

    #[test]
    fn queued_input_replays_in_order_after_cooldown() {
        let now = Instant::now();
        let mut injector = injector();
        let mut child = Writes::default();
        let mut terminal = Vec::new();

        injector.begin("fix it", now, &mut child, &mut terminal).expect("begin");
        injector.queue_input(b"h");
        injector.queue_input(b"i");
        injector
            .poll(now + Duration::from_millis(200), &mut child, &mut terminal)
            .expect("poll");
        injector.queue_input(b"!");

        assert_eq!(
            injector
                .poll(now + Duration::from_millis(3199), &mut child, &mut terminal)
                .expect("poll"),
            None
        );
        assert!(injector.in_flight());

        let progress = injector
            .poll(now + Duration::from_millis(3200), &mut child, &mut terminal)
            .expect("poll");
        assert_eq!(progress, Some(InjectionProgress::Completed { replayed: 3 }));
        assert!(!injector.in_flight());
        assert_eq!(&child.writes[2..], &[b"h".to_vec(), b"i".to_vec(), b"!".to_vec()]);
        assert!(injector.queued_input().is_empty());
    }

    #[test]
    fn abort_clears_state() {
        let now = Instant::now();
        let mut injector = injector();
        let mut child = Writes::default();
        injector.begin("x", now, &mut child, &mut Vec::new()).expect("begin");
        injector.queue_input(b"q");
        injector.abort();
        assert!(!injector.in_flight());
        assert!(injector.queued_input().is_empty());
        assert_eq!(injector.next_deadline(), None);
    }
}
