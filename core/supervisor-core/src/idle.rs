//! Idle/busy detection over child output.
//!
//! ## State Machine
//!
//! ```text
//!            output matches an idle pattern
//!   Busy ─────────────────────────────────────▶ Idle   (emits idle)
//!        ─── no output for `inactivity` ──────▶
//!   Idle ─── output not matching any pattern ─▶ Busy
//! ```
//!
//! The patterns are keyword/regex heuristics and are meant to be approximate:
//! injecting slightly early or slightly late is acceptable, getting stuck is
//! not. `IdleWait` guarantees progress by resolving on timeout.
//!
//! The heuristic sits behind [`OutputClassifier`] so it can be swapped
//! without touching the orchestrator.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Busy,
}

/// Narrow seam for the output heuristics.
pub trait OutputClassifier: Send {
    /// Does this chunk of output look like the child is waiting for input?
    fn classify(&self, bytes: &[u8]) -> Activity;

    /// Does this text read like the child claiming its task is finished?
    fn is_completion_claim(&self, text: &str) -> bool;
}

// Shell/agent prompt markers, completion glyphs and a trailing line break.
static IDLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\$ ?$",
        r"> ?$",
        r"Human: ?$",
        r"Assistant: ?$",
        r"✓|✅|完成|Done",
        r"\n$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    completion_keywords: Vec<String>,
    ignore_keywords: Vec<String>,
}

impl HeuristicClassifier {
    pub fn new(completion_keywords: Vec<String>, ignore_keywords: Vec<String>) -> Self {
        Self {
            completion_keywords: lowercase_all(completion_keywords),
            ignore_keywords: lowercase_all(ignore_keywords),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.completion_keywords.clone(),
            config.ignore_keywords.clone(),
        )
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

fn lowercase_all(words: Vec<String>) -> Vec<String> {
    words
        .into_iter()
        .map(|word| word.to_lowercase())
        .filter(|word| !word.trim().is_empty())
        .collect()
}

impl OutputClassifier for HeuristicClassifier {
    fn classify(&self, bytes: &[u8]) -> Activity {
        let text = String::from_utf8_lossy(bytes);
        if IDLE_PATTERNS.iter().any(|pattern| pattern.is_match(&text)) {
            Activity::Idle
        } else {
            Activity::Busy
        }
    }

    fn is_completion_claim(&self, text: &str) -> bool {
        let mut lower = text.to_lowercase();
        for phrase in &self.ignore_keywords {
            if lower.contains(phrase.as_str()) {
                lower = lower.replace(phrase.as_str(), " ");
            }
        }
        self.completion_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
    }
}

pub struct IdleDetector {
    classifier: Box<dyn OutputClassifier>,
    activity: Activity,
    last_activity: Instant,
    inactivity: Duration,
}

impl IdleDetector {
    pub fn new(classifier: Box<dyn OutputClassifier>, inactivity: Duration, now: Instant) -> Self {
        Self {
            classifier,
            activity: Activity::Idle,
            last_activity: now,
            inactivity,
        }
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn is_idle(&self) -> bool {
        self.activity == Activity::Idle
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn classifier(&self) -> &dyn OutputClassifier {
        self.classifier.as_ref()
    }

    /// Feed a chunk of child output. Returns true on a Busy → Idle transition.
    pub fn observe(&mut self, bytes: &[u8], now: Instant) -> bool {
        if bytes.is_empty() {
            return false;
        }
        self.last_activity = now;
        let was_idle = self.is_idle();
        self.activity = self.classifier.classify(bytes);
        !was_idle && self.is_idle()
    }

    /// Inactivity check. Returns true on a Busy → Idle transition.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.is_idle() {
            return false;
        }
        if now.saturating_duration_since(self.last_activity) >= self.inactivity {
            self.activity = Activity::Idle;
            return true;
        }
        false
    }

    /// When the inactivity threshold will flip a busy child to idle.
    pub fn inactivity_deadline(&self) -> Option<Instant> {
        match self.activity {
            Activity::Busy => Some(self.last_activity + self.inactivity),
            Activity::Idle => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child went (or already was) idle.
    Idle,
    /// Forced continue after the maximum wait.
    TimedOut,
    /// The child exited while waiting.
    Cancelled,
}

/// A pending `waitForIdle`, resolved by polling from the control loop.
#[derive(Debug, Clone)]
pub struct IdleWait {
    started: Instant,
    deadline: Instant,
    cancelled: bool,
}

impl IdleWait {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            started: now,
            deadline: now + timeout,
            cancelled: false,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// `Some` once the wait is over; `None` while it should keep waiting.
    pub fn poll(&self, detector: &IdleDetector, now: Instant) -> Option<WaitOutcome> {
        if self.cancelled {
            return Some(WaitOutcome::Cancelled);
        }
        if detector.is_idle() {
            return Some(WaitOutcome::Idle);
        }
        if now >= self.deadline {
            return Some(WaitOutcome::TimedOut);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(now: Instant) -> IdleDetector {
        IdleDetector::new(
            Box::new(HeuristicClassifier::default()),
            Duration::from_millis(2000),
            now,
        )
    }

    #[test]
    fn starts_idle() {
        let now = Instant::now();
        assert!(detector(now).is_idle());
    }

    #[test]
    fn busy_output_then_prompt_goes_idle() {
        let now = Instant::now();
        let mut detector = detector(now);

        assert!(!detector.observe(b"Thinking", now));
        assert_eq!(detector.activity(), Activity::Busy);

        let became_idle = detector.observe(b"all tests pass\n> ", now + Duration::from_millis(10));
        assert!(became_idle);
        assert!(detector.is_idle());
    }

    #[test]
    fn inactivity_goes_idle() {
        let now = Instant::now();
        let mut detector = detector(now);
        detector.observe(b"streaming tokens", now);

        assert!(!detector.tick(now + Duration::from_millis(1999)));
        assert!(!detector.is_idle());
        assert!(detector.tick(now + Duration::from_millis(2000)));
        assert!(detector.is_idle());
        assert!(!detector.tick(now + Duration::from_millis(2500)));
    }

    #[test]
    fn output_resets_inactivity_clock() {
        let now = Instant::now();
        let mut detector = detector(now);
        detector.observe(b"a", now);
        detector.observe(b"b", now + Duration::from_millis(1500));
        assert!(!detector.tick(now + Duration::from_millis(2500)));
        assert_eq!(
            detector.inactivity_deadline(),
            Some(now + Duration::from_millis(3500))
        );
    }

    #[test]
    fn classifier_patterns() {
        let classifier = HeuristicClassifier::default();
        assert_eq!(classifier.classify(b"user@host:~$ "), Activity::Idle);
        assert_eq!(classifier.classify(b"Human: "), Activity::Idle);
        assert_eq!(classifier.classify("✅ wrote file".as_bytes()), Activity::Idle);
        assert_eq!(classifier.classify(b"line\n"), Activity::Idle);
        assert_eq!(classifier.classify(b"\x1b[2K\x1b[1Gworking"), Activity::Busy);
    }

    #[test]
    fn completion_claims_respect_ignore_phrases() {
        let classifier = HeuristicClassifier::default();
        assert!(classifier.is_completion_claim("All Done! The feature is implemented."));
        assert!(classifier.is_completion_claim("任务完成"));
        assert!(!classifier.is_completion_claim("This is not done yet"));
        assert!(!classifier.is_completion_claim("almost done, running tests"));
        assert!(!classifier.is_completion_claim("reading files"));
    }

    #[test]
    fn wait_returns_immediately_when_idle() {
        let now = Instant::now();
        let detector = detector(now);
        let wait = IdleWait::new(now, Duration::from_secs(30));
        assert_eq!(wait.poll(&detector, now), Some(WaitOutcome::Idle));
    }

    #[test]
    fn wait_times_out_when_never_idle() {
        let now = Instant::now();
        let mut detector = detector(now);
        let wait = IdleWait::new(now, Duration::from_secs(30));

        // Keep the child busy for the whole window.
        for step in 0..30u64 {
            let at = now + Duration::from_secs(step);
            detector.observe(b"still working", at);
            detector.tick(at);
            assert_eq!(wait.poll(&detector, at), None);
        }
        let at = now + Duration::from_secs(30);
        detector.observe(b"still working", at);
        assert_eq!(wait.poll(&detector, at), Some(WaitOutcome::TimedOut));
    }

    #[test]
    fn cancelled_wait_resolves() {
        let now = Instant::now();
        let mut detector = detector(now);
        detector.observe(b"busy", now);
        let mut wait = IdleWait::new(now, Duration::from_secs(30));
        wait.cancel();
        assert_eq!(wait.poll(&detector, now), Some(WaitOutcome::Cancelled));
    }
}
