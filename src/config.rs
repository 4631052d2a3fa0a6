//! Engine configuration
//!
//! Everything a session needs is passed in explicitly through [`EngineConfig`].
//! The engine never reads process-wide state; only the `rlm` binary calls
//! [`ModelSettings::from_env`] to build its models.

use std::time::Duration;

use tracing::warn;

/// Hard per-session ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    /// Maximum number of iterations (primary model turns)
    pub max_iterations: usize,
    /// Maximum number of sub-model calls across `llm_query` and `llm_query_batched`
    pub max_llm_calls: usize,
    /// Maximum characters of captured output kept per execution
    pub max_output_chars: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_llm_calls: 50,
            max_output_chars: 100_000,
        }
    }
}

/// Timeouts applied to every unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// One primary model call (including the client's own retries)
    pub primary_call: Duration,
    /// Soft deadline for one sandbox execution; checked at host-function boundaries
    ///
    /// Pure computation never reaches a host function, and the interpreter's
    /// loop limit counts each loop on its own. Nested loops without host
    /// calls therefore run past this deadline and end at `sandbox_grace`.
    pub sandbox_execution: Duration,
    /// Extra time after the soft deadline before the sandbox counts as unresponsive
    ///
    /// Missing it ends the session as fatal. The interpreter thread cannot be
    /// interrupted and keeps running until its loop limits stop it.
    pub sandbox_grace: Duration,
    /// One sub-model call
    pub sub_call: Duration,
    /// One caller-supplied tool invocation
    pub tool_call: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            primary_call: Duration::from_secs(120),
            sandbox_execution: Duration::from_secs(60),
            sandbox_grace: Duration::from_secs(5),
            sub_call: Duration::from_secs(120),
            tool_call: Duration::from_secs(30),
        }
    }
}

/// Interpreter and sub-query limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Iterations a single loop may run before the interpreter aborts it
    pub loop_iteration_limit: u64,
    /// Maximum call depth inside the interpreter
    pub recursion_limit: usize,
    /// Largest prompt (in chars) accepted by the secondary model
    pub max_prompt_chars: usize,
    /// Preview length of input variables in the opening prompt
    pub preview_chars: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
            max_prompt_chars: 500_000,
            preview_chars: 500,
        }
    }
}

/// What a session returns when the iteration budget runs out before SUBMIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Report `BudgetExhausted` to the caller
    #[default]
    Fail,
    /// Bind the last non-empty reasoning to the only output field.
    /// Contracts with more than one output field still fail.
    LastReasoning,
    /// Ask the primary model once more to extract the outputs from the trajectory
    Extract,
}

/// Configuration for one engine (shared by all sessions it starts)
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub budgets: Budgets,
    pub timeouts: Timeouts,
    pub limits: SandboxLimits,
    pub fallback: FallbackPolicy,
    /// Custom system prompt (uses the built-in one if None)
    pub system_prompt: Option<String>,
}

/// Model selection for the `rlm` binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    /// Model driving the iterate-and-execute loop
    pub main_model: String,
    /// Model behind `llm_query`; defaults to `main_model`
    pub sub_model: Option<String>,
    /// Base URL of the Ollama server
    pub ollama_url: String,
    /// Retries per model request on transport errors
    pub max_retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            main_model: "qwen3".to_string(),
            sub_model: None,
            ollama_url: "http://localhost:11434".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl ModelSettings {
    /// Read model settings and budget overrides from `RLM_*` environment variables
    pub fn from_env() -> (Self, Budgets) {
        let defaults = Self::default();
        let settings = Self {
            main_model: std::env::var("RLM_MAIN_MODEL").unwrap_or(defaults.main_model),
            sub_model: std::env::var("RLM_SUB_MODEL").ok().filter(|m| !m.is_empty()),
            ollama_url: std::env::var("RLM_OLLAMA_URL").unwrap_or(defaults.ollama_url),
            max_retries: defaults.max_retries,
            retry_delay_ms: defaults.retry_delay_ms,
        };

        let base = Budgets::default();
        let budgets = Budgets {
            max_iterations: env_usize("RLM_MAX_ITERATIONS", base.max_iterations),
            max_llm_calls: env_usize("RLM_MAX_LLM_CALLS", base.max_llm_calls),
            max_output_chars: env_usize("RLM_MAX_OUTPUT_CHARS", base.max_output_chars),
        };

        (settings, budgets)
    }

    /// Name of the secondary model, falling back to the main model
    pub fn sub_model_or_main(&self) -> &str {
        self.sub_model.as_deref().unwrap_or(&self.main_model)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => parse_positive(&raw).unwrap_or_else(|| {
            warn!(key, value = %raw, default, "Ignoring invalid budget override");
            default
        }),
        Err(_) => default,
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

/// Errors raised while constructing a session, before any iteration runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The signature string could not be parsed
    MalformedSignature { signature: String, reason: String },
    /// A caller tool uses one of the built-in names
    ReservedToolName(String),
    /// Two caller tools share a name
    DuplicateTool(String),
    /// A caller tool name is not a valid sandbox identifier
    InvalidToolName(String),
    /// A caller tool shares its name with a declared field
    ToolShadowsField(String),
    /// A declared input field has no value
    MissingInput(String),
    /// A value was supplied for an undeclared input
    UnexpectedInput(String),
    /// Sessions must be started from inside a Tokio runtime
    NoRuntime,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MalformedSignature { signature, reason } => {
                write!(f, "Malformed signature '{}': {}", signature, reason)
            }
            ConfigError::ReservedToolName(name) => {
                write!(f, "Tool name '{}' is reserved for a built-in", name)
            }
            ConfigError::DuplicateTool(name) => write!(f, "Tool '{}' registered twice", name),
            ConfigError::InvalidToolName(name) => {
                write!(f, "Tool name '{}' is not a valid identifier", name)
            }
            ConfigError::ToolShadowsField(name) => {
                write!(f, "Tool '{}' collides with a signature field", name)
            }
            ConfigError::MissingInput(name) => write!(f, "Missing value for input '{}'", name),
            ConfigError::UnexpectedInput(name) => {
                write!(f, "Input '{}' is not declared in the signature", name)
            }
            ConfigError::NoRuntime => write!(f, "No Tokio runtime available for the sandbox"),
        }
    }
}

impl std::error::Error for ConfigError {}
