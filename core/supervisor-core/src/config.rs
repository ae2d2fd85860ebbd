//! Runtime configuration.
//!
//! Loaded once at startup from `<state_dir>/config.toml` and then owned by the
//! orchestrator; collaborators receive it by reference. Every field has a
//! default so a missing file (or a partial one) is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const SOCKET_ENV: &str = "CC_SUPERVISOR_SOCKET";
const DEFAULT_SOCKET_NAME: &str = "cc-supervisor-rpc.sock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program launched inside the pseudo-terminal.
    pub child_command: String,
    pub idle_check_interval_ms: u64,
    pub idle_inactivity_ms: u64,
    pub max_wait_for_idle_ms: u64,
    pub duplicate_fix_cooldown_secs: u64,
    pub registry_poll_interval_ms: u64,
    pub issue_poll_interval_ms: u64,
    pub injection_settle_ms: u64,
    pub injection_cooldown_ms: u64,
    pub injection_marker: String,
    pub fix_prompt_prefix: String,
    pub socket_path: Option<PathBuf>,
    pub completion_keywords: Vec<String>,
    pub ignore_keywords: Vec<String>,
    pub verifier: VerifierConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            child_command: "claude".to_string(),
            idle_check_interval_ms: 500,
            idle_inactivity_ms: 2_000,
            max_wait_for_idle_ms: 30_000,
            duplicate_fix_cooldown_secs: 300,
            registry_poll_interval_ms: 1_000,
            issue_poll_interval_ms: 500,
            injection_settle_ms: 200,
            injection_cooldown_ms: 3_000,
            injection_marker: "[🤖 auto-fix]".to_string(),
            fix_prompt_prefix: "Please analyze and fix the following issues:".to_string(),
            socket_path: None,
            completion_keywords: default_completion_keywords(),
            ignore_keywords: default_ignore_keywords(),
            verifier: VerifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    /// argv of the external verifier; empty disables completion-claim checks.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub delay_after_claim_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30,
            delay_after_claim_ms: 3_000,
        }
    }
}

impl VerifierConfig {
    pub fn enabled(&self) -> bool {
        self.command.first().is_some_and(|program| !program.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn delay_after_claim(&self) -> Duration {
        Duration::from_millis(self.delay_after_claim_ms)
    }
}

impl SupervisorConfig {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn idle_inactivity(&self) -> Duration {
        Duration::from_millis(self.idle_inactivity_ms)
    }

    pub fn max_wait_for_idle(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_idle_ms)
    }

    pub fn duplicate_fix_cooldown(&self) -> Duration {
        Duration::from_secs(self.duplicate_fix_cooldown_secs)
    }

    pub fn registry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.registry_poll_interval_ms)
    }

    pub fn issue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.issue_poll_interval_ms)
    }

    pub fn injection_settle(&self) -> Duration {
        Duration::from_millis(self.injection_settle_ms)
    }

    pub fn injection_cooldown(&self) -> Duration {
        Duration::from_millis(self.injection_cooldown_ms)
    }

    /// Socket path resolution order: env override, config file, temp dir.
    pub fn resolved_socket_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(SOCKET_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        self.socket_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SOCKET_NAME))
    }
}

fn default_completion_keywords() -> Vec<String> {
    [
        "done",
        "complete",
        "finished",
        "完成",
        "搞定",
        "ready",
        "fixed",
        "solved",
        "implemented",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ignore_keywords() -> Vec<String> {
    [
        "not done",
        "not complete",
        "not finished",
        "will be done",
        "to be done",
        "getting done",
        "almost done",
        "nearly done",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Load the config from `path`, or defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        return Ok(SupervisorConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| SupervisorError::io("Failed to read config", err))?;
    toml::from_str::<SupervisorConfig>(&content).map_err(|err| SupervisorError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
