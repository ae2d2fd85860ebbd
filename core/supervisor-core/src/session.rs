//! Session binding: the on-disk registry and the output sniffer.
//!
//! The registry file holds the id of the project's active session and nothing
//! else. It may be rewritten at any time by the agent's own lifecycle hook, so
//! the orchestrator polls it instead of waiting for a notification.
//!
//! The sniffer is a best-effort scan of child output for an embedded session
//! id. The first id it finds is kept for the lifetime of the sniffer.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use supervisor_protocol::validate_session_id;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};

/// Where a binding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// `--session` on the command line.
    Pinned,
    /// The registry file changed.
    Registry,
    /// A `registerSession` socket call.
    Registered,
    /// Found in child output.
    Sniffed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub project_path: PathBuf,
    pub bound_at: DateTime<Utc>,
    pub source: SessionSource,
}

impl Session {
    pub fn new(session_id: impl Into<String>, project_path: &Path, source: SessionSource) -> Self {
        Self {
            session_id: session_id.into(),
            project_path: project_path.to_path_buf(),
            bound_at: Utc::now(),
            source,
        }
    }

    /// First eight characters, for log lines.
    pub fn short_id(&self) -> &str {
        short_id(&self.session_id)
    }
}

pub fn short_id(session_id: &str) -> &str {
    match session_id.char_indices().nth(8) {
        Some((index, _)) => &session_id[..index],
        None => session_id,
    }
}

/// Plain-text registry file: `<project dir>/active-session`.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current registry content. Missing or blank files read as `None`.
    pub fn read(&self) -> Result<Option<String>> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SupervisorError::io("Failed to read session registry", err)),
        };

        let session_id = content.trim();
        if session_id.is_empty() {
            return Ok(None);
        }
        validate_session_id(session_id)
            .map_err(|err| SupervisorError::InvalidSessionId(err.message))?;
        Ok(Some(session_id.to_string()))
    }

    pub fn write(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)
            .map_err(|err| SupervisorError::InvalidSessionId(err.message))?;
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| SupervisorError::io("Failed to create registry directory", err))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        fs_err::write(&tmp_path, session_id)
            .map_err(|err| SupervisorError::io("Failed to write session registry", err))?;
        fs_err::rename(&tmp_path, &self.path)
            .map_err(|err| SupervisorError::io("Failed to commit session registry", err))?;
        Ok(())
    }

    /// One poll cycle: returns the registry's id when it differs from `bound`.
    ///
    /// Read failures are not fatal; the next cycle will try again.
    pub fn poll(&self, bound: Option<&str>) -> Option<String> {
        match self.read() {
            Ok(Some(session_id)) if bound != Some(session_id.as_str()) => Some(session_id),
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "Session registry poll failed");
                None
            }
        }
    }
}

static RE_JSON_SESSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""session_id"\s*:\s*"([^"]+)""#).unwrap());
static RE_TRANSCRIPT_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12})\.jsonl").unwrap()
});

const SNIFF_CARRY_MAX: usize = 4096;

/// Scans child output for a session id: a JSON line with a `session_id`
/// field, or a transcript path like `.../<uuid>.jsonl`.
#[derive(Debug, Default)]
pub struct SessionSniffer {
    captured: Option<String>,
    carry: String,
    disabled: bool,
}

impl SessionSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sniffer that never captures (used when a session is pinned).
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn captured(&self) -> Option<&str> {
        self.captured.as_deref()
    }

    /// Feed output; returns the id only on the call that first captures it.
    pub fn observe(&mut self, bytes: &[u8]) -> Option<String> {
        if self.disabled || self.captured.is_some() {
            return None;
        }

        self.carry.push_str(&String::from_utf8_lossy(bytes));
        let text = std::mem::take(&mut self.carry);

        let mut found = None;
        let mut lines = text.split('\n').peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            if is_last && !text.ends_with('\n') {
                // Partial line; keep for the next chunk.
                self.carry = tail(line, SNIFF_CARRY_MAX).to_string();
                break;
            }
            if let Some(session_id) = session_id_from_json_line(line) {
                found = Some(session_id);
                break;
            }
        }

        if found.is_none() {
            found = RE_TRANSCRIPT_PATH
                .captures(&text)
                .map(|caps| caps[1].to_string());
        }

        if let Some(session_id) = &found {
            debug!(session_id = %session_id, "Captured session id from child output");
            self.captured = Some(session_id.clone());
            self.carry.clear();
        }
        found
    }
}

fn session_id_from_json_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }

    let from_json = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| {
            value
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
    let candidate = from_json.or_else(|| {
        RE_JSON_SESSION_ID
            .captures(trimmed)
            .map(|caps| caps[1].to_string())
    })?;

    match validate_session_id(&candidate) {
        Ok(()) => Some(candidate),
        Err(err) => {
            warn!(message = %err.message, "Ignoring malformed session id in child output");
            None
        }
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip_and_poll() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let registry = SessionRegistry::new(temp_dir.path().join("proj").join("active-session"));

        assert_eq!(registry.read().expect("read"), None);
        assert_eq!(registry.poll(None), None);

        registry.write("session-a").expect("write");
        assert_eq!(registry.poll(None), Some("session-a".to_string()));
        assert_eq!(registry.poll(Some("session-a")), None);

        registry.write("session-b").expect("write");
        assert_eq!(registry.poll(Some("session-a")), Some("session-b".to_string()));
    }

    #[test]
    fn registry_trims_external_writes() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("active-session");
        fs_err::write(&path, "  session-x\n").expect("write");
        let registry = SessionRegistry::new(path);
        assert_eq!(registry.read().expect("read"), Some("session-x".to_string()));
    }

    #[test]
    fn registry_rejects_garbage_without_panicking() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("active-session");
        fs_err::write(&path, "../../escape").expect("write");
        let registry = SessionRegistry::new(path);
        assert!(registry.read().is_err());
        assert_eq!(registry.poll(None), None);
    }

    #[test]
    fn sniffer_captures_json_session_id_once() {
        let mut sniffer = SessionSniffer::new();
        assert_eq!(sniffer.observe(b"booting...\n"), None);
        let captured = sniffer.observe(b"{\"type\":\"init\",\"session_id\":\"abc-123\"}\n");
        assert_eq!(captured, Some("abc-123".to_string()));

        let later = sniffer.observe(b"{\"session_id\":\"other\"}\n");
        assert_eq!(later, None);
        assert_eq!(sniffer.captured(), Some("abc-123"));
    }

    #[test]
    fn sniffer_joins_lines_split_across_chunks() {
        let mut sniffer = SessionSniffer::new();
        assert_eq!(sniffer.observe(b"{\"session_id\":\"split"), None);
        assert_eq!(
            sniffer.observe(b"-id\"}\r\n"),
            Some("split-id".to_string())
        );
    }

    #[test]
    fn sniffer_reads_transcript_paths() {
        let mut sniffer = SessionSniffer::new();
        let output = b"saved to ~/.claude/projects/x/5f0c7a2e-1b2c-4d5e-8f90-0123456789ab.jsonl";
        assert_eq!(
            sniffer.observe(output),
            Some("5f0c7a2e-1b2c-4d5e-8f90-0123456789ab".to_string())
        );
    }

    #[test]
    fn disabled_sniffer_never_captures() {
        let mut sniffer = SessionSniffer::disabled();
        assert_eq!(sniffer.observe(b"{\"session_id\":\"abc\"}\n"), None);
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
