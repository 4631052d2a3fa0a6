//! Sandbox Executor - runs model-written code in an isolated interpreter
//!
//! ```text
//!  driver (async)                       sandbox thread (owns boa Context)
//!  ──────────────                       ─────────────────────────────────
//!  execute(code) ── Request ──────────►  eval(code)
//!        │                                 ├─ print       → OutputBuffer
//!        │                                 ├─ llm_query   → Handle::block_on(SubQueryService)
//!        │                                 ├─ user tool   → Handle::block_on(Tool::invoke)
//!        │                                 └─ SUBMIT      → record + halt
//!        ◄──────────── oneshot reply ─────  ExecutionOutcome
//!        │
//!  no reply within deadline + grace ──► SandboxError::Unresponsive (fatal)
//! ```
//!
//! The interpreter has no filesystem, network or process bindings. Global
//! scope persists across executions of one session and is dropped with it.

pub mod executor;
pub mod output;
pub mod runtime;

use std::time::Duration;

pub use executor::SandboxHandle;
pub use output::{CapturedOutput, OutputBuffer};
pub use runtime::RuntimeSetup;

use crate::submission::RawSubmission;
use crate::trajectory::StepError;

/// Result of running one code block
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Captured output, truncation marker included
    pub output: String,
    pub truncated: bool,
    /// Output length before truncation
    pub total_chars: usize,
    /// Arguments of a SUBMIT call, if one happened
    pub submission: Option<RawSubmission>,
    /// Recoverable failure of the code block
    pub error: Option<StepError>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Label used for the execution metrics
    pub fn status(&self) -> &'static str {
        match (&self.submission, &self.error) {
            (Some(_), _) => "submitted",
            (None, Some(StepError::Timeout(_))) => "timeout",
            (None, Some(_)) => "error",
            (None, None) => "ok",
        }
    }
}

/// Infrastructure failures; every variant ends the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The sandbox thread could not be started
    Spawn(String),
    /// The interpreter could not be prepared
    Init(String),
    /// The sandbox thread is gone
    Unavailable,
    /// No answer within the execution deadline plus grace period
    Unresponsive(Duration),
    /// The secondary model failed irrecoverably during execution
    SubModel(String),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Spawn(msg) => write!(f, "Failed to start sandbox: {}", msg),
            SandboxError::Init(msg) => write!(f, "Failed to initialize sandbox: {}", msg),
            SandboxError::Unavailable => write!(f, "Sandbox is no longer running"),
            SandboxError::Unresponsive(d) => {
                write!(f, "Sandbox unresponsive after {:.1}s", d.as_secs_f64())
            }
            SandboxError::SubModel(msg) => write!(f, "Sub-model failure: {}", msg),
        }
    }
}

impl std::error::Error for SandboxError {}
