//! # supervisor-core
//!
//! Supervision logic for an interactive coding agent running inside a
//! pseudo-terminal: session binding, issue intake (file and socket), duplicate
//! fix suppression, idle detection and command injection.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The proxy drives [`Engine`] from one
//!   control thread and feeds it through channels.
//! - **Single owner**: All mutable supervision state lives in [`Engine`];
//!   configuration is passed in once, never read from globals.
//! - **Graceful degradation**: Transport and verification failures are logged
//!   and absorbed. Only the child process dying ends supervision.
//! - **Terminal-free**: Nothing here touches a real TTY, so every behavior is
//!   testable with in-memory writers and explicit `Instant`s.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use supervisor_core::{Engine, HeuristicClassifier, ProjectPaths, SupervisorConfig};
//!
//! let paths = ProjectPaths::new(&state_dir, &project_root)?;
//! let mut engine = Engine::new(config, paths, Box::new(HeuristicClassifier::default()), pty_writer, stdout, Instant::now());
//! engine.start(None, Instant::now())?;
//! engine.on_child_output(&chunk, Instant::now())?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod idle;
pub mod inject;
pub mod issues;
pub mod ledger;
pub mod paths;
pub mod rpc;
pub mod session;
pub mod verifier;

pub use config::{load_config, SupervisorConfig, VerifierConfig, CONFIG_FILE_NAME};
pub use engine::{Engine, InputDisposition, IssueDisposition, ProxyState};
pub use error::{Result, SupervisorError};
pub use idle::{Activity, HeuristicClassifier, IdleDetector, IdleWait, OutputClassifier, WaitOutcome};
pub use inject::{flatten, CommandInjector};
pub use issues::{IssueFileWatcher, IssueReport, IssueSource};
pub use ledger::{fingerprint, FixDecision, FixLedger};
pub use paths::{logs_dir, project_name, state_dir, ProjectPaths};
pub use rpc::{ChannelCallback, ChannelEvent, RpcServer};
pub use session::{Session, SessionRegistry, SessionSniffer, SessionSource};
pub use verifier::{CommandVerifier, VerificationOutcome, VerificationRequest, Verifier};
