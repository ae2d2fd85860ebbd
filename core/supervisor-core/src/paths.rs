//! On-disk layout for supervisor state.
//!
//! ```text
//! <state_dir>/                         $CC_SUPERVISOR_HOME or ~/.cc-supervisor
//! ├── config.toml
//! ├── logs/
//! └── projects/<project-name>/
//!     ├── active-session               # Session Registry
//!     ├── <session>.issues             # pending issue (file transport)
//!     └── <session>.history.json       # Fix-History Ledger
//! ```
//!
//! `<project-name>` is the absolute project path with `/` replaced by `-` and
//! the leading `-` dropped, the same naming the agent uses for its own
//! per-project directories.

use std::path::{Path, PathBuf};

use crate::error::{Result, SupervisorError};

pub const STATE_DIR_ENV: &str = "CC_SUPERVISOR_HOME";
const STATE_DIR_NAME: &str = ".cc-supervisor";
const REGISTRY_FILE_NAME: &str = "active-session";

/// Resolve the state directory (env override first, then the home directory).
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir().ok_or(SupervisorError::HomeDirNotFound)?;
    Ok(home.join(STATE_DIR_NAME))
}

/// Strips trailing slashes except for root "/".
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Directory name used for a project path.
pub fn project_name(project_path: &str) -> String {
    let normalized = normalize_path(project_path);
    let dashed = normalized.replace('/', "-");
    let name = dashed.strip_prefix('-').unwrap_or(&dashed);
    if name.is_empty() {
        "root".to_string()
    } else {
        name.to_string()
    }
}

/// All per-project paths, derived deterministically from the project path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    project_path: PathBuf,
    dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(state_dir: &Path, project_path: &Path) -> Result<Self> {
        let display = project_path.to_string_lossy().to_string();
        if !project_path.is_absolute() {
            return Err(SupervisorError::InvalidProjectPath {
                path: display,
                reason: "project path must be absolute".to_string(),
            });
        }
        let dir = state_dir.join("projects").join(project_name(&display));
        Ok(Self {
            project_path: project_path.to_path_buf(),
            dir,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn project_dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry_file(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE_NAME)
    }

    pub fn issues_file(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.issues", session_id))
    }

    pub fn ledger_file(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.history.json", session_id))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs_err::create_dir_all(&self.dir)
            .map_err(|err| SupervisorError::io("Failed to create project state directory", err))
    }
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}
