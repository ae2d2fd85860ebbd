//! The orchestrator's decision logic, independent of any real terminal.
//!
//! `Engine` owns every piece of mutable supervision state and is driven by a
//! single control thread: child output, user input, channel events, verifier
//! results and periodic ticks all arrive as method calls carrying the current
//! `Instant`. Nothing here blocks or sleeps; every wait (idle, settle,
//! cooldown, poll intervals, verification delay) is a deadline checked on
//! `tick`.
//!
//! ## Remediation path
//!
//! ```text
//! issue (file | socket | verifier)
//!   └─▶ bound session? ──no──▶ dropped
//!         └─▶ ledger.check ──duplicate──▶ suppressed
//!               └─▶ pending queue ─▶ wait for idle (or timeout) ─▶ injector
//! ```
//!
//! Output is written to the terminal before it is inspected, so inspection can
//! never delay or reorder what the user sees.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::io::Write;
use std::time::Instant;
use supervisor_protocol::validate_session_id;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::idle::{IdleDetector, IdleWait, OutputClassifier, WaitOutcome};
use crate::inject::{CommandInjector, InjectionProgress};
use crate::issues::{IssueFileWatcher, IssueReport, IssueSource};
use crate::ledger::{FixDecision, FixLedger};
use crate::paths::ProjectPaths;
use crate::rpc::ChannelEvent;
use crate::session::{Session, SessionRegistry, SessionSniffer, SessionSource};
use crate::verifier::{VerificationOutcome, VerificationRequest};

const INTERRUPT: u8 = 0x03;
const ANALYSIS_MAX_CHARS: usize = 10_000;
const ANALYSIS_KEEP_CHARS: usize = 5_000;

static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>78]")
        .unwrap()
});

/// Snapshot of the orchestrator's live view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyState {
    pub idle: bool,
    pub last_activity_at: Instant,
    pub injection_in_flight: bool,
    pub queued_user_input: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    Forwarded,
    Queued,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueDisposition {
    /// Accepted and waiting for (or already in) injection.
    Queued { fingerprint: String },
    /// Same body remediated within the cooldown.
    Duplicate { fingerprint: String },
    /// Not for the bound session (or nothing is bound).
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFix {
    session_id: String,
    fingerprint: String,
    body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Idle,
    Scheduled { due: Instant },
    Running,
}

pub struct Engine<C: Write, T: Write> {
    config: SupervisorConfig,
    paths: ProjectPaths,
    child: C,
    terminal: T,
    detector: IdleDetector,
    sniffer: SessionSniffer,
    registry: SessionRegistry,
    session: Option<Session>,
    watcher: Option<IssueFileWatcher>,
    ledger: Option<FixLedger>,
    injector: CommandInjector,
    pending: VecDeque<PendingFix>,
    idle_wait: Option<IdleWait>,
    analysis: String,
    verification: Verification,
    next_registry_poll: Instant,
    next_issue_poll: Instant,
    clock_base: Instant,
    wall_base_ms: i64,
    child_exited: bool,
}

impl<C: Write, T: Write> Engine<C, T> {
    pub fn new(
        config: SupervisorConfig,
        paths: ProjectPaths,
        classifier: Box<dyn OutputClassifier>,
        child: C,
        terminal: T,
        now: Instant,
    ) -> Self {
        let detector = IdleDetector::new(classifier, config.idle_inactivity(), now);
        let injector = CommandInjector::new(
            config.injection_marker.clone(),
            config.injection_settle(),
            config.injection_cooldown(),
        );
        let registry = SessionRegistry::new(paths.registry_file());
        Self {
            config,
            paths,
            child,
            terminal,
            detector,
            sniffer: SessionSniffer::new(),
            registry,
            session: None,
            watcher: None,
            ledger: None,
            injector,
            pending: VecDeque::new(),
            idle_wait: None,
            analysis: String::new(),
            verification: Verification::Idle,
            next_registry_poll: now,
            next_issue_poll: now,
            clock_base: now,
            wall_base_ms: chrono::Utc::now().timestamp_millis(),
            child_exited: false,
        }
    }

    /// Prepare state directories and take the initial binding: the pinned
    /// session if given, otherwise whatever the registry currently says.
    pub fn start(&mut self, pinned: Option<&str>, now: Instant) -> Result<()> {
        self.paths.ensure_dir()?;
        info!(
            project = %self.paths.project_path().display(),
            state = %self.paths.project_dir().display(),
            "Supervision started"
        );
        match pinned {
            Some(session_id) => self.pin_session(session_id, now)?,
            None => self.poll_registry(now),
        }
        self.next_registry_poll = now + self.config.registry_poll_interval();
        self.next_issue_poll = now + self.config.issue_poll_interval();
        Ok(())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.session_id.as_str())
    }

    pub fn pending_fixes(&self) -> usize {
        self.pending.len()
    }

    pub fn child(&self) -> &C {
        &self.child
    }

    pub fn child_mut(&mut self) -> &mut C {
        &mut self.child
    }

    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut T {
        &mut self.terminal
    }

    pub fn state(&self) -> ProxyState {
        ProxyState {
            idle: self.detector.is_idle(),
            last_activity_at: self.detector.last_activity(),
            injection_in_flight: self.injector.in_flight(),
            queued_user_input: self.injector.queued_input().iter().cloned().collect(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Terminal I/O
    // ─────────────────────────────────────────────────────────────────────

    /// Relay child output to the terminal, then inspect it.
    pub fn on_child_output(&mut self, bytes: &[u8], now: Instant) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.terminal
            .write_all(bytes)
            .and_then(|_| self.terminal.flush())
            .map_err(|err| SupervisorError::io("Failed to write to terminal", err))?;

        if self.detector.observe(bytes, now) {
            debug!("Child went idle (prompt pattern)");
        }

        if let Some(session_id) = self.sniffer.observe(bytes) {
            self.bind_session(&session_id, SessionSource::Sniffed, now);
        }

        self.analyze_output(bytes, now);
        self.drive(now)
    }

    /// Route user keystrokes: forward, hold during an injection, or stop.
    pub fn on_user_input(&mut self, bytes: &[u8], now: Instant) -> Result<InputDisposition> {
        if bytes.contains(&INTERRUPT) {
            info!("Interrupt received from terminal");
            return Ok(InputDisposition::Shutdown);
        }
        if bytes.is_empty() {
            return Ok(InputDisposition::Forwarded);
        }
        if self.injector.in_flight() {
            self.injector.queue_input(bytes);
            return Ok(InputDisposition::Queued);
        }

        self.child
            .write_all(bytes)
            .and_then(|_| self.child.flush())
            .map_err(|err| SupervisorError::io("Failed to forward input to child", err))?;
        if bytes.iter().any(|b| *b == b'\r' || *b == b'\n') {
            self.analysis.clear();
        }
        self.drive(now)?;
        Ok(InputDisposition::Forwarded)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session binding
    // ─────────────────────────────────────────────────────────────────────

    /// Bind an operator-supplied session and stop sniffing for others.
    pub fn pin_session(&mut self, session_id: &str, now: Instant) -> Result<()> {
        validate_session_id(session_id)
            .map_err(|err| SupervisorError::InvalidSessionId(err.message))?;
        self.sniffer = SessionSniffer::disabled();
        self.bind_session(session_id, SessionSource::Pinned, now);
        Ok(())
    }

    /// Switch the engine to `session_id`. Returns false when nothing changed.
    ///
    /// Everything keyed by the old session (file watch, ledger, queued fixes,
    /// scheduled verification) is released; the new session's issue file is
    /// checked immediately.
    pub fn bind_session(&mut self, session_id: &str, source: SessionSource, now: Instant) -> bool {
        if self.session_id() == Some(session_id) {
            return false;
        }
        if let Err(err) = validate_session_id(session_id) {
            warn!(message = %err.message, ?source, "Refusing to bind malformed session id");
            return false;
        }

        let now_ms = self.wall_ms(now);
        if let Some(ledger) = self.ledger.as_mut() {
            if let Err(err) = ledger.flush(now_ms) {
                warn!(error = %err, "Failed to persist fix history for previous session");
            }
        }
        if !self.pending.is_empty() {
            info!(dropped = self.pending.len(), "Dropping queued fixes for previous session");
        }
        self.pending.clear();
        self.idle_wait = None;
        if self.verification != Verification::Running {
            self.verification = Verification::Idle;
        }

        let previous = self.session.as_ref().map(|session| session.short_id().to_string());
        let session = Session::new(session_id, self.paths.project_path(), source);
        info!(
            session_id = %session.short_id(),
            previous = previous.as_deref().unwrap_or("-"),
            ?source,
            "Session bound"
        );

        self.watcher = Some(IssueFileWatcher::new(
            session_id,
            self.paths.issues_file(session_id),
        ));
        let ledger = FixLedger::load(
            self.paths.ledger_file(session_id),
            self.config.duplicate_fix_cooldown(),
        );
        if !ledger.is_empty() {
            debug!(entries = ledger.len(), path = %ledger.path().display(), "Fix history loaded");
        }
        self.ledger = Some(ledger);
        self.session = Some(session);

        if source != SessionSource::Registry {
            if let Err(err) = self.registry.write(session_id) {
                warn!(error = %err, path = %self.registry.path().display(), "Failed to update session registry");
            }
        }

        // A freshly bound session may already have an issue waiting.
        self.poll_issues(now);
        true
    }

    fn poll_registry(&mut self, now: Instant) {
        if let Some(session_id) = self.registry.poll(self.session_id()) {
            self.bind_session(&session_id, SessionSource::Registry, now);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Issue intake
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_channel_event(&mut self, event: ChannelEvent, now: Instant) -> Result<()> {
        match event {
            ChannelEvent::SessionRegistered {
                session_id,
                project_path,
            } => {
                if let Some(path) = project_path {
                    if path != self.paths.project_path() {
                        debug!(path = %path.display(), "Ignoring registration for another project");
                        return Ok(());
                    }
                }
                self.bind_session(&session_id, SessionSource::Registered, now);
                self.drive(now)
            }
            ChannelEvent::IssueReported(report) => {
                self.submit_issue(report, now)?;
                Ok(())
            }
        }
    }

    /// Dedup an issue and queue it for injection.
    pub fn submit_issue(&mut self, report: IssueReport, now: Instant) -> Result<IssueDisposition> {
        let bound = match self.session_id() {
            Some(bound) if bound == report.session_id => bound.to_string(),
            _ => {
                debug!(
                    session_id = %report.session_id,
                    source = ?report.source,
                    "Dropping issue for a session that is not bound"
                );
                return Ok(IssueDisposition::Ignored);
            }
        };

        let now_ms = self.wall_ms(now);
        let Some(ledger) = self.ledger.as_mut() else {
            return Ok(IssueDisposition::Ignored);
        };
        let fingerprint = match ledger.check(&report.body, now_ms) {
            FixDecision::Suppress { fingerprint, .. } => {
                info!(session_id = %bound, fingerprint = %fingerprint, "Duplicate issue suppressed");
                return Ok(IssueDisposition::Duplicate { fingerprint });
            }
            FixDecision::Accept { fingerprint } => fingerprint,
        };

        info!(
            session_id = %bound,
            fingerprint = %fingerprint,
            source = ?report.source,
            bytes = report.body.len(),
            "Issue accepted for remediation"
        );
        self.pending.push_back(PendingFix {
            session_id: bound,
            fingerprint: fingerprint.clone(),
            body: report.body,
        });
        self.drive(now)?;
        Ok(IssueDisposition::Queued { fingerprint })
    }

    fn poll_issues(&mut self, now: Instant) {
        let polled = match self.watcher.as_mut() {
            Some(watcher) => watcher.poll(),
            None => return,
        };
        match polled {
            Ok(Some(report)) => {
                if let Err(err) = self.submit_issue(report, now) {
                    warn!(error = %err, "Failed to act on issue file");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Issue file poll failed"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completion-claim verification
    // ─────────────────────────────────────────────────────────────────────

    fn analyze_output(&mut self, bytes: &[u8], now: Instant) {
        let text = String::from_utf8_lossy(bytes);
        self.analysis.push_str(&RE_ANSI.replace_all(&text, ""));
        trim_to_last_chars(&mut self.analysis, ANALYSIS_MAX_CHARS, ANALYSIS_KEEP_CHARS);

        if !self.config.verifier.enabled()
            || self.verification != Verification::Idle
            || self.session.is_none()
            || self.injector.in_flight()
        {
            return;
        }
        if self.detector.classifier().is_completion_claim(&self.analysis) {
            let due = now + self.config.verifier.delay_after_claim();
            info!(
                delay_ms = self.config.verifier.delay_after_claim_ms,
                "Completion claim detected; verification scheduled"
            );
            self.verification = Verification::Scheduled { due };
        }
    }

    /// Hand out a due verification. The caller runs it off the control
    /// thread and reports back through `on_verification_result`.
    pub fn take_verification_request(&mut self, now: Instant) -> Option<VerificationRequest> {
        let Verification::Scheduled { due } = self.verification else {
            return None;
        };
        if now < due {
            return None;
        }
        let Some(session) = self.session.as_ref() else {
            self.verification = Verification::Idle;
            return None;
        };

        self.verification = Verification::Running;
        let request = VerificationRequest {
            session_id: session.session_id.clone(),
            project_root: self.paths.project_path().to_path_buf(),
            recent_context: std::mem::take(&mut self.analysis),
        };
        debug!(session_id = %session.short_id(), "Verification started");
        Some(request)
    }

    pub fn on_verification_result(
        &mut self,
        session_id: &str,
        outcome: VerificationOutcome,
        now: Instant,
    ) -> Result<Option<IssueDisposition>> {
        self.verification = Verification::Idle;
        match outcome {
            VerificationOutcome::Passed => {
                info!("Verification passed");
                Ok(None)
            }
            VerificationOutcome::Inconclusive { reason } => {
                warn!(reason = %reason, "Verification inconclusive; no action taken");
                Ok(None)
            }
            VerificationOutcome::Failed { response } => {
                info!(bytes = response.len(), "Verification failed");
                match IssueReport::new(session_id, response, IssueSource::Verifier) {
                    Some(report) => self.submit_issue(report, now).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    /// Advance every deadline: inactivity, registry and issue polls, idle
    /// waits, injection phases.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.child_exited {
            return Ok(());
        }
        if self.detector.tick(now) {
            debug!("Child went idle (inactivity)");
        }
        if now >= self.next_registry_poll {
            self.poll_registry(now);
            self.next_registry_poll = now + self.config.registry_poll_interval();
        }
        if now >= self.next_issue_poll {
            self.poll_issues(now);
            self.next_issue_poll = now + self.config.issue_poll_interval();
        }
        self.drive(now)
    }

    /// Earliest instant at which `tick` or `take_verification_request` has
    /// work to do. `None` once the child has exited.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.child_exited {
            return None;
        }
        let verification_due = match self.verification {
            Verification::Scheduled { due } => Some(due),
            Verification::Idle | Verification::Running => None,
        };
        [
            Some(self.next_registry_poll),
            Some(self.next_issue_poll),
            self.injector.next_deadline(),
            self.detector.inactivity_deadline(),
            self.idle_wait.as_ref().map(IdleWait::deadline),
            verification_due,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Move the injection pipeline forward as far as `now` allows.
    fn drive(&mut self, now: Instant) -> Result<()> {
        if self.child_exited {
            return Ok(());
        }

        if self.injector.in_flight() {
            let progress = self
                .injector
                .poll(now, &mut self.child, &mut self.terminal)?;
            if let Some(InjectionProgress::Completed { replayed }) = progress {
                debug!(replayed, pending = self.pending.len(), "Injector ready");
            }
            if self.injector.in_flight() {
                return Ok(());
            }
        }

        if self.pending.is_empty() {
            self.idle_wait = None;
            return Ok(());
        }

        let max_wait = self.config.max_wait_for_idle();
        let wait = self.idle_wait.get_or_insert_with(|| IdleWait::new(now, max_wait));
        let waited = now.saturating_duration_since(wait.started());
        let outcome = match wait.poll(&self.detector, now) {
            Some(outcome) => outcome,
            None => return Ok(()),
        };
        self.idle_wait = None;

        match outcome {
            WaitOutcome::Cancelled => {
                self.pending.clear();
                return Ok(());
            }
            WaitOutcome::TimedOut => {
                info!(
                    waited_ms = waited.as_millis() as u64,
                    "Child never went idle; injecting anyway"
                );
            }
            WaitOutcome::Idle => {}
        }

        let Some(fix) = self.pending.pop_front() else {
            return Ok(());
        };
        let instruction = format!("{}\n\n{}", self.config.fix_prompt_prefix, fix.body);
        debug!(
            session_id = %fix.session_id,
            fingerprint = %fix.fingerprint,
            "Starting injection"
        );
        self.injector
            .begin(&instruction, now, &mut self.child, &mut self.terminal)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// The child is gone: cancel waits and drop everything still queued.
    pub fn on_child_exit(&mut self) {
        self.child_exited = true;
        if let Some(mut wait) = self.idle_wait.take() {
            wait.cancel();
            debug!(outcome = ?wait.poll(&self.detector, Instant::now()), "Idle wait cancelled");
        }
        if !self.pending.is_empty() {
            info!(dropped = self.pending.len(), "Child exited with fixes still queued");
        }
        self.pending.clear();
        self.injector.abort();
        self.verification = Verification::Idle;
    }

    /// Persist the ledger and drop in-flight work.
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        self.injector.abort();
        self.pending.clear();
        self.idle_wait = None;
        let now_ms = self.wall_ms(now);
        match self.ledger.as_mut() {
            Some(ledger) => ledger.flush(now_ms),
            None => Ok(()),
        }
    }

    fn wall_ms(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.clock_base);
        self.wall_base_ms
            .saturating_add(elapsed.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// Once `text` exceeds `max` characters, keep only the last `keep`.
fn trim_to_last_chars(text: &mut String, max: usize, keep: usize) {
    let count = text.chars().count();
    if count <= max {
        return;
    }
    let skip = count - keep;
    if let Some((index, _)) = text.char_indices().nth(skip) {
        text.drain(..index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::HeuristicClassifier;
    use std::time::Duration;

    fn engine(state_dir: &std::path::Path, now: Instant) -> Engine<Vec<u8>, Vec<u8>> {
        let paths = ProjectPaths::new(state_dir, std::path::Path::new("/work/app")).expect("paths");
        Engine::new(
            SupervisorConfig::default(),
            paths,
            Box::new(HeuristicClassifier::default()),
            Vec::new(),
            Vec::new(),
            now,
        )
    }

    #[test]
    fn trim_keeps_tail() {
        let mut text = "a".repeat(10_001);
        text.push('z');
        trim_to_last_chars(&mut text, 10_000, 5_000);
        assert_eq!(text.chars().count(), 5_000);
        assert!(text.ends_with('z'));

        let mut short = "héllo".to_string();
        trim_to_last_chars(&mut short, 10, 2);
        assert_eq!(short, "héllo");
    }

    #[test]
    fn ansi_is_stripped_for_analysis() {
        assert_eq!(RE_ANSI.replace_all("\x1b[1;32mDone\x1b[0m\x1b]0;title\x07", ""), "Done");
    }

    #[test]
    fn interrupt_requests_shutdown_without_forwarding() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(None, now).expect("start");

        assert_eq!(
            engine.on_user_input(b"ab\x03", now).expect("input"),
            InputDisposition::Shutdown
        );
        assert!(engine.child().is_empty());
    }

    #[test]
    fn pin_binds_and_writes_registry() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(Some("pinned-1"), now).expect("start");

        assert_eq!(engine.session_id(), Some("pinned-1"));
        assert_eq!(engine.session().map(|s| s.source), Some(SessionSource::Pinned));
        let registry = SessionRegistry::new(engine.paths().registry_file());
        assert_eq!(registry.read().expect("read"), Some("pinned-1".to_string()));

        // Pinned sessions are not replaced by ids sniffed from output.
        engine
            .on_child_output(b"{\"session_id\":\"other\"}\n", now)
            .expect("output");
        assert_eq!(engine.session_id(), Some("pinned-1"));
    }

    #[test]
    fn pin_rejects_malformed_id() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        let err = engine.start(Some("../x"), now).expect_err("invalid");
        assert!(matches!(err, SupervisorError::InvalidSessionId(_)));
    }

    #[test]
    fn sniffed_session_is_bound() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(None, now).expect("start");
        assert_eq!(engine.session_id(), None);

        engine
            .on_child_output(b"{\"type\":\"init\",\"session_id\":\"sniffed-1\"}\n", now)
            .expect("output");
        assert_eq!(engine.session_id(), Some("sniffed-1"));
        assert_eq!(engine.session().map(|s| s.source), Some(SessionSource::Sniffed));
    }

    #[test]
    fn issue_without_binding_is_ignored() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(None, now).expect("start");

        let report = IssueReport::new("nobody", "boom", IssueSource::Socket).expect("report");
        assert_eq!(
            engine.submit_issue(report, now).expect("submit"),
            IssueDisposition::Ignored
        );
        assert!(engine.child().is_empty());
    }

    #[test]
    fn registration_for_other_project_is_ignored() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(None, now).expect("start");

        engine
            .on_channel_event(
                ChannelEvent::SessionRegistered {
                    session_id: "elsewhere".to_string(),
                    project_path: Some("/work/other".into()),
                },
                now,
            )
            .expect("event");
        assert_eq!(engine.session_id(), None);

        engine
            .on_channel_event(
                ChannelEvent::SessionRegistered {
                    session_id: "here".to_string(),
                    project_path: Some("/work/app".into()),
                },
                now,
            )
            .expect("event");
        assert_eq!(engine.session_id(), Some("here"));
    }

    #[test]
    fn completion_claim_schedules_one_verification() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut config = SupervisorConfig::default();
        config.verifier.command = vec!["./verify.sh".to_string()];
        let paths = ProjectPaths::new(temp_dir.path(), std::path::Path::new("/work/app")).expect("paths");
        let mut engine = Engine::new(
            config,
            paths,
            Box::new(HeuristicClassifier::default()),
            Vec::new(),
            Vec::new(),
            now,
        );
        engine.start(Some("s-1"), now).expect("start");

        engine.on_child_output(b"Working on it\n", now).expect("output");
        assert_eq!(engine.take_verification_request(now + Duration::from_secs(10)), None);

        engine
            .on_child_output(b"\x1b[32mAll done!\x1b[0m", now)
            .expect("output");
        assert_eq!(engine.take_verification_request(now + Duration::from_millis(2999)), None);

        let request = engine
            .take_verification_request(now + Duration::from_millis(3000))
            .expect("due");
        assert_eq!(request.session_id, "s-1");
        assert_eq!(request.project_root, std::path::PathBuf::from("/work/app"));
        assert!(request.recent_context.contains("All done!"));

        // Running: no second request until the result is in.
        engine.on_child_output(b"done done", now).expect("output");
        assert_eq!(engine.take_verification_request(now + Duration::from_secs(60)), None);

        let later = now + Duration::from_secs(4);
        let disposition = engine
            .on_verification_result(
                "s-1",
                VerificationOutcome::Failed {
                    response: "2 tests failed".to_string(),
                },
                later,
            )
            .expect("result");
        assert!(matches!(disposition, Some(IssueDisposition::Queued { .. })));
    }

    #[test]
    fn next_deadline_tracks_the_earliest_timer() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(None, now).expect("start");

        // Idle, nothing queued: the issue poll (500 ms) comes first.
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_millis(500)));

        // Busy output arms the inactivity deadline, but the issue poll is earlier.
        engine.on_child_output(b"thinking", now).expect("output");
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_millis(500)));

        engine.on_child_exit();
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn verification_is_off_without_a_command() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let now = Instant::now();
        let mut engine = engine(temp_dir.path(), now);
        engine.start(Some("s-1"), now).expect("start");
        engine.on_child_output(b"All done!", now).expect("output");
        assert_eq!(engine.take_verification_request(now + Duration::from_secs(60)), None);
    }
}
