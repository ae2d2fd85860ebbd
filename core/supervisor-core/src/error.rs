//! Error types for supervisor-core operations.

use std::path::PathBuf;

/// All errors that can occur in supervisor-core operations.
///
/// Transport and verification problems are mostly logged and absorbed by the
/// engine; these variants surface where the caller has to decide.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found; set CC_SUPERVISOR_HOME")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid project path: {path}: {reason}")]
    InvalidProjectPath { path: String, reason: String },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Child Process Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to start `{command}`: {details}. {remediation}")]
    SpawnFailed {
        command: String,
        details: String,
        remediation: String,
    },

    #[error("Pseudo-terminal error: {0}")]
    Pty(String),

    // ─────────────────────────────────────────────────────────────────────
    // Channel Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Socket error: {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        SupervisorError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using SupervisorError.
pub type Result<T> = std::result::Result<T, SupervisorError>;

impl From<SupervisorError> for String {
    fn from(err: SupervisorError) -> String {
        err.to_string()
    }
}
