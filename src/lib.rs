//! rlm-engine - recursive execution engine for question answering over large inputs
//!
//! Instead of pasting a huge input into the model's context, the engine
//! stores it in variables inside a sandboxed JavaScript interpreter and lets
//! the primary model write code against it, one iteration at a time, until
//! the code calls `SUBMIT(...)` with the final answer.
//!
//! # Modules
//!
//! - `engine` - Execution Driver: session lifecycle, budgets, fallback policy
//! - `sandbox` - Sandbox Executor: isolated Boa interpreter on its own thread
//! - `subquery` - Sub-Query Service: `llm_query` / `llm_query_batched`
//! - `tools` - Tool Registry: built-ins plus caller tools
//! - `submission` - Submission Validator
//! - `trajectory` - Trajectory Recorder and persistent run records
//! - `signature` - input/output contract parsing
//! - `model` - language model trait, Ollama client, offline test models
//! - `config` - budgets, timeouts, limits
//! - `metrics` - Prometheus metrics
//! - `telemetry` - tracing-subscriber and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use rlm_engine::{Engine, EngineConfig, Inputs, OllamaModel, Signature};
//!
//! let model = Arc::new(OllamaModel::new("http://localhost:11434", "qwen3"));
//! let engine = Engine::new(Signature::parse("document, query -> answer")?, model, EngineConfig::default());
//!
//! let result = engine
//!     .run(Inputs::new().with("document", "The sky is blue.").with("query", "What color is the sky?"))
//!     .await?;
//! println!("{}", result.outputs.get_str("answer").unwrap_or_default());
//! ```

pub mod config;
pub mod engine;
pub mod metrics;
pub mod model;
pub mod sandbox;
pub mod signature;
pub mod submission;
pub mod subquery;
pub mod telemetry;
pub mod tools;
pub mod trajectory;

// Re-export commonly used types at crate root for convenience
pub use config::{Budgets, ConfigError, EngineConfig, FallbackPolicy, ModelSettings, SandboxLimits, Timeouts};
pub use engine::{Engine, FallbackKind, Inputs, RunError, RunResult, SessionState};
pub use model::{ChatMessage, FnModel, LanguageModel, ModelError, OllamaModel, ScriptedModel};
pub use signature::Signature;
pub use submission::Submission;
pub use tools::{Tool, ToolError, ToolRegistry};
pub use trajectory::{Step, StepError, Trajectory, TrajectoryStore};
