//! Engine module - the iterate-until-submit control loop
//!
//! # Architecture
//!
//! ```text
//! caller ─► Engine::run(inputs)
//!              │
//!              ├─ Session::new: bind inputs, merge tools, build prompts
//!              ├─ SandboxHandle::start (one thread per session)
//!              │
//!              └─ loop:
//!                   iterations ≥ max? ──► BudgetExhausted (+ fallback policy)
//!                   primary model ──► reasoning + code
//!                   sandbox.execute(code)
//!                   trajectory.push(step)
//!                   SUBMIT valid?  ──► Completed
//!                   otherwise      ──► observation ─► next iteration
//! ```

pub mod driver;
pub mod prompt;
pub mod variables;

pub use driver::{Engine, FallbackKind, FatalCause, RunError, RunResult, SessionState};
pub use prompt::DEFAULT_SYSTEM_PROMPT;
pub use variables::{Inputs, VariableInfo};
