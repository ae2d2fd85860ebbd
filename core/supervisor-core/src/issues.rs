//! Issue reports and the file-watch transport.
//!
//! An external verifier drops diagnostic text into `<session>.issues`.
//! Existence with a positive size means "pending". A poll first renames the
//! file to `<session>.issues.consuming`, then reads and deletes that copy. A
//! writer that races with the poll creates a fresh `<session>.issues`, which
//! the next poll picks up. Bytes that are not valid UTF-8 are replaced, never
//! rejected, so one bad byte cannot leave the file stuck.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSource {
    File,
    Socket,
    Verifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReport {
    pub session_id: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub source: IssueSource,
}

impl IssueReport {
    /// Returns `None` for a blank body.
    pub fn new(session_id: impl Into<String>, body: impl Into<String>, source: IssueSource) -> Option<Self> {
        let body = body.into();
        if body.trim().is_empty() {
            return None;
        }
        Some(Self {
            session_id: session_id.into(),
            body,
            received_at: Utc::now(),
            source,
        })
    }
}

/// Polls one session's issue file.
#[derive(Debug)]
pub struct IssueFileWatcher {
    session_id: String,
    path: PathBuf,
    last_size: u64,
}

impl IssueFileWatcher {
    pub fn new(session_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            session_id: session_id.into(),
            path,
            last_size: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One poll cycle. `Ok(None)` when nothing is pending.
    pub fn poll(&mut self) -> Result<Option<IssueReport>> {
        // Left behind by an interrupted poll.
        let claimed = self.claimed_path();
        if claimed.exists() {
            return self.consume(&claimed);
        }

        let size = match fs_err::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.last_size = 0;
                return Ok(None);
            }
            Err(err) => return Err(SupervisorError::io("Failed to stat issue file", err)),
        };

        if size == 0 || size <= self.last_size {
            self.last_size = size;
            return Ok(None);
        }

        info!(path = %self.path.display(), bytes = size, "Issue file detected");
        match self.claim(size)? {
            Some(claimed) => self.consume(&claimed),
            None => Ok(None),
        }
    }

    fn claimed_path(&self) -> PathBuf {
        self.path.with_extension("issues.consuming")
    }

    /// Move the pending file aside. `None` if it vanished first.
    fn claim(&mut self, size: u64) -> Result<Option<PathBuf>> {
        let claimed = self.claimed_path();
        match fs_err::rename(&self.path, &claimed) {
            Ok(()) => {
                self.last_size = 0;
                Ok(Some(claimed))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.last_size = 0;
                Ok(None)
            }
            Err(err) => {
                // Only retry once the file grows.
                self.last_size = size;
                Err(SupervisorError::io("Failed to claim issue file", err))
            }
        }
    }

    fn consume(&self, claimed: &Path) -> Result<Option<IssueReport>> {
        let bytes = fs_err::read(claimed)
            .map_err(|err| SupervisorError::io("Failed to read issue file", err))?;
        if let Err(err) = fs_err::remove_file(claimed) {
            warn!(error = %err, path = %claimed.display(), "Failed to delete claimed issue file");
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        let report = IssueReport::new(self.session_id.clone(), body, IssueSource::File);
        if report.is_none() {
            debug!(path = %self.path.display(), "Discarded blank issue file");
        }
        Ok(report)
    }
}
