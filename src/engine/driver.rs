//! Execution Driver - the iterate-until-submit loop
//!
//! Each call to [`Engine::run`] builds an independent [`Session`] with its
//! own sandbox thread, sub-query budget and trajectory. Nothing is shared
//! between sessions, so one engine can serve concurrent callers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig, FallbackPolicy};
use crate::metrics::{PRIMARY_CALL_DURATION, SESSIONS, SESSION_ITERATIONS};
use crate::model::{ChatMessage, LanguageModel, ModelError};
use crate::sandbox::{ExecutionOutcome, RuntimeSetup, SandboxError, SandboxHandle};
use crate::signature::Signature;
use crate::submission::{self, RawSubmission, Submission};
use crate::subquery::SubQueryService;
use crate::tools::{check_user_tool_name, Tool, ToolRegistry};
use crate::trajectory::{Step, StepError, Trajectory};

use super::prompt::{
    extract_messages, observation_message, opening_message, parse_json_object, parse_response,
    system_prompt,
};
use super::variables::{Inputs, VariableInfo};

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Running,
    Submitted,
    BudgetExhausted,
    Completed,
    Fatal,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Running => "running",
            SessionState::Submitted => "submitted",
            SessionState::BudgetExhausted => "budget_exhausted",
            SessionState::Completed => "completed",
            SessionState::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fallback produced the outputs of an exhausted session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    LastReasoning,
    Extract,
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub session_id: String,
    /// One value per declared output field
    pub outputs: Submission,
    pub trajectory: Trajectory,
    /// Reasoning of the step whose submission was accepted
    pub closing_reasoning: String,
    pub iterations: usize,
    /// Sub-model calls consumed
    pub llm_calls: usize,
    /// Set when the outputs come from a fallback instead of SUBMIT
    pub fallback: Option<FallbackKind>,
}

/// Why a session ended as `Fatal`
#[derive(Debug)]
pub enum FatalCause {
    Sandbox(SandboxError),
    PrimaryModel(ModelError),
    PrimaryTimeout(Duration),
}

impl std::fmt::Display for FatalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCause::Sandbox(e) => write!(f, "{}", e),
            FatalCause::PrimaryModel(e) => write!(f, "Primary model failed: {}", e),
            FatalCause::PrimaryTimeout(d) => {
                write!(f, "Primary model timed out after {:.1}s", d.as_secs_f64())
            }
        }
    }
}

/// Error type for engine runs
#[derive(Debug)]
pub enum RunError {
    /// Rejected before any iteration ran
    Config(ConfigError),
    /// Iteration budget used up without an accepted submission
    BudgetExhausted {
        session_id: String,
        trajectory: Trajectory,
        llm_calls: usize,
    },
    /// Infrastructure failure
    Fatal {
        session_id: String,
        cause: FatalCause,
        trajectory: Trajectory,
    },
}

impl RunError {
    /// Terminal state the session ended in
    pub fn status(&self) -> SessionState {
        match self {
            RunError::Config(_) => SessionState::Init,
            RunError::BudgetExhausted { .. } => SessionState::BudgetExhausted,
            RunError::Fatal { .. } => SessionState::Fatal,
        }
    }

    /// Steps recorded before the failure
    pub fn trajectory(&self) -> Option<&Trajectory> {
        match self {
            RunError::Config(_) => None,
            RunError::BudgetExhausted { trajectory, .. } | RunError::Fatal { trajectory, .. } => {
                Some(trajectory)
            }
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RunError::Config(_) => None,
            RunError::BudgetExhausted { session_id, .. } | RunError::Fatal { session_id, .. } => {
                Some(session_id)
            }
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "Configuration error: {}", e),
            RunError::BudgetExhausted { trajectory, .. } => write!(
                f,
                "Iteration budget exhausted after {} step(s) without a valid submission",
                trajectory.len()
            ),
            RunError::Fatal { cause, .. } => write!(f, "Session failed: {}", cause),
        }
    }
}

impl std::error::Error for RunError {}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        RunError::Config(e)
    }
}

/// Recursive execution engine
///
/// Holds everything a session needs except the inputs. Each [`Engine::run`]
/// starts a fresh sandbox; a sandbox is never shared between sessions.
pub struct Engine {
    signature: Signature,
    primary: Arc<dyn LanguageModel>,
    sub_model: Option<Arc<dyn LanguageModel>>,
    tools: Vec<(String, Arc<dyn Tool>)>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine
    ///
    /// # Arguments
    /// * `signature` - Input and output contract
    /// * `primary` - Model driving the loop
    /// * `config` - Budgets, timeouts, limits and fallback policy
    pub fn new(signature: Signature, primary: Arc<dyn LanguageModel>, config: EngineConfig) -> Self {
        Self {
            signature,
            primary,
            sub_model: None,
            tools: Vec::new(),
            config,
        }
    }

    /// Use a separate model behind `llm_query`
    pub fn with_sub_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.sub_model = Some(model);
        self
    }

    /// Expose a caller tool inside the sandbox
    ///
    /// Fails immediately on reserved, duplicate or field-shadowing names.
    pub fn with_tool(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Result<Self, ConfigError> {
        let name = name.into();
        check_tool_name(&self.signature, &name)?;
        if self.tools.iter().any(|(existing, _)| *existing == name) {
            return Err(ConfigError::DuplicateTool(name));
        }
        self.tools.push((name, tool));
        Ok(self)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Answer one query over `inputs`
    pub async fn run(&self, inputs: Inputs) -> Result<RunResult, RunError> {
        let session_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "session",
            session_id = %session_id,
            signature = %self.signature,
            model = %self.primary.name(),
            otel.name = "session"
        );

        async {
            info!(session_id = %session_id, "Starting session");
            let result = match Session::new(self, session_id.clone(), inputs) {
                Ok(session) => session.run().await,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session rejected");
                    Err(RunError::Config(e))
                }
            };
            record_outcome(&result);
            result
        }
        .instrument(span)
        .await
    }
}

fn check_tool_name(signature: &Signature, name: &str) -> Result<(), ConfigError> {
    check_user_tool_name(name)?;
    let shadows = signature
        .input_names()
        .chain(signature.output_names())
        .any(|field| field == name);
    if shadows {
        return Err(ConfigError::ToolShadowsField(name.to_string()));
    }
    Ok(())
}

fn record_outcome(result: &Result<RunResult, RunError>) {
    let (status, iterations) = match result {
        Ok(r) if r.fallback.is_some() => ("fallback", r.iterations),
        Ok(r) => ("completed", r.iterations),
        Err(RunError::Config(_)) => ("config_error", 0),
        Err(e) => (e.status().as_str(), e.trajectory().map(Trajectory::len).unwrap_or(0)),
    };
    SESSIONS.with_label_values(&[status]).inc();
    if status != "config_error" {
        SESSION_ITERATIONS.observe(iterations as f64);
    }
}

/// One end-to-end execution; owned by the driver and dropped when it ends
struct Session<'e> {
    id: String,
    engine: &'e Engine,
    registry: ToolRegistry,
    inputs: Vec<(String, Value)>,
    sub_queries: Arc<SubQueryService>,
    runtime: Handle,
    state: SessionState,
    trajectory: Trajectory,
    messages: Vec<ChatMessage>,
}

impl<'e> Session<'e> {
    fn new(engine: &'e Engine, id: String, inputs: Inputs) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let config = &engine.config;

        for (name, _) in &engine.tools {
            check_tool_name(&engine.signature, name)?;
        }
        let registry = ToolRegistry::new(engine.tools.iter().cloned())?;
        let inputs = inputs.bind(&engine.signature)?;

        let sub_model = engine
            .sub_model
            .clone()
            .unwrap_or_else(|| engine.primary.clone());
        let sub_queries = Arc::new(SubQueryService::new(
            sub_model,
            config.budgets.max_llm_calls,
            config.limits.max_prompt_chars,
            config.timeouts.sub_call,
        ));

        let variables: Vec<VariableInfo> = inputs
            .iter()
            .map(|(name, value)| VariableInfo::describe(name, value, config.limits.preview_chars))
            .collect();
        let messages = vec![
            ChatMessage::system(system_prompt(
                config.system_prompt.as_deref(),
                &engine.signature,
                &registry,
                &config.budgets,
            )),
            ChatMessage::user(opening_message(&engine.signature, &variables)),
        ];

        debug!(session_id = %id, tools = registry.len(), inputs = inputs.len(), "Session constructed");
        Ok(Self {
            id,
            engine,
            registry,
            inputs,
            sub_queries,
            runtime,
            state: SessionState::Init,
            trajectory: Trajectory::new(),
            messages,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.id, from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    async fn run(mut self) -> Result<RunResult, RunError> {
        let engine = self.engine;
        let config = &engine.config;
        let setup = RuntimeSetup {
            inputs: std::mem::take(&mut self.inputs),
            tools: self.registry.clone(),
            sub_queries: self.sub_queries.clone(),
            runtime: self.runtime.clone(),
            max_output_chars: config.budgets.max_output_chars,
            limits: config.limits,
            timeouts: config.timeouts,
        };
        let sandbox = match SandboxHandle::start(&self.id, setup).await {
            Ok(sandbox) => sandbox,
            Err(e) => return Err(self.fatal(FatalCause::Sandbox(e))),
        };
        self.transition(SessionState::Running);

        loop {
            // Checked before any new work starts
            if self.trajectory.len() >= config.budgets.max_iterations {
                self.transition(SessionState::BudgetExhausted);
                return self.exhausted().await;
            }

            let index = self.trajectory.len();
            let span = info_span!(
                "iteration",
                session_id = %self.id,
                iteration = index,
                otel.name = "iteration"
            );
            if let Some(result) = self.iterate(&sandbox, index).instrument(span).await? {
                return Ok(result);
            }
        }
    }

    /// One primary call plus at most one execution; `Some` once a submission is accepted
    async fn iterate(
        &mut self,
        sandbox: &SandboxHandle,
        index: usize,
    ) -> Result<Option<RunResult>, RunError> {
        let reply = match self.call_primary(&self.messages, index).await {
            Ok(reply) => reply,
            Err(cause) => return Err(self.fatal(cause)),
        };
        self.messages.push(ChatMessage::assistant(reply.clone()));
        let parsed = parse_response(&reply);

        if parsed.code.trim().is_empty() {
            info!(session_id = %self.id, iteration = index, "Reasoning-only step");
            self.record(Step::reasoning_only(index, parsed.reasoning));
            return Ok(None);
        }

        let exec_span = info_span!(
            "sandbox_execution",
            session_id = %self.id,
            iteration = index,
            code_len = parsed.code.len(),
            otel.name = "sandbox_execution"
        );
        let outcome = match sandbox.execute(&parsed.code).instrument(exec_span).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The step is still part of the audit trail
                self.record(Step {
                    index,
                    reasoning: parsed.reasoning,
                    code: parsed.code,
                    output: String::new(),
                    truncated: false,
                    error: None,
                    duration_ms: 0.0,
                });
                return Err(self.fatal(FatalCause::Sandbox(e)));
            }
        };

        let ExecutionOutcome {
            output,
            truncated,
            submission: raw,
            error,
            duration,
            ..
        } = outcome;
        let mut step = Step {
            index,
            reasoning: parsed.reasoning,
            code: parsed.code,
            output,
            truncated,
            error,
            duration_ms: duration.as_secs_f64() * 1000.0,
        };

        match raw {
            Some(raw) => {
                self.transition(SessionState::Submitted);
                match submission::validate(&self.engine.signature, raw) {
                    Ok(outputs) => {
                        let closing_reasoning = step.reasoning.clone();
                        self.record(step);
                        self.transition(SessionState::Completed);
                        info!(session_id = %self.id, iterations = self.trajectory.len(), "Submission accepted");
                        return Ok(Some(self.finish(outputs, closing_reasoning, None)));
                    }
                    Err(rejection) => {
                        warn!(session_id = %self.id, iteration = index, reason = %rejection, "Submission rejected");
                        append_line(&mut step.output, &rejection.0);
                        step.error = Some(StepError::InvalidSubmission(rejection.0));
                        self.record(step);
                        self.transition(SessionState::Running);
                    }
                }
            }
            None => {
                if let Some(error) = &step.error {
                    debug!(session_id = %self.id, iteration = index, error = %error, "Step error");
                    let text = match error {
                        StepError::Runtime(msg) => format!("[Error] {}", msg),
                        StepError::Timeout(msg) => format!("[Timeout] {}", msg),
                        StepError::InvalidSubmission(msg) => msg.clone(),
                    };
                    append_line(&mut step.output, &text);
                }
                self.record(step);
            }
        }
        Ok(None)
    }

    /// Append a step and queue the observation for the next turn
    fn record(&mut self, step: Step) {
        let remaining = self
            .engine
            .config
            .budgets
            .max_iterations
            .saturating_sub(step.index + 1);
        self.messages
            .push(ChatMessage::user(observation_message(&step, remaining)));
        info!(
            session_id = %self.id,
            iteration = step.index,
            code_len = step.code.len(),
            output_len = step.output.len(),
            truncated = step.truncated,
            "Step recorded"
        );
        self.trajectory.push(step);
    }

    async fn call_primary(&self, messages: &[ChatMessage], index: usize) -> Result<String, FatalCause> {
        let model = &self.engine.primary;
        let limit = self.engine.config.timeouts.primary_call;
        let span = info_span!(
            "llm_call",
            session_id = %self.id,
            iteration = index,
            model = %model.name(),
            otel.name = "llm_call"
        );

        let start = Instant::now();
        let result = tokio::time::timeout(limit, model.complete(messages))
            .instrument(span)
            .await;
        let elapsed = start.elapsed();
        PRIMARY_CALL_DURATION
            .with_label_values(&[model.name()])
            .observe(elapsed.as_secs_f64());

        match result {
            Ok(Ok(text)) => {
                debug!(
                    session_id = %self.id,
                    iteration = index,
                    duration_ms = elapsed.as_secs_f64() * 1000.0,
                    "Primary call completed"
                );
                Ok(text)
            }
            Ok(Err(e)) => Err(FatalCause::PrimaryModel(e)),
            Err(_) => Err(FatalCause::PrimaryTimeout(limit)),
        }
    }

    fn finish(
        &mut self,
        outputs: Submission,
        closing_reasoning: String,
        fallback: Option<FallbackKind>,
    ) -> RunResult {
        RunResult {
            session_id: self.id.clone(),
            outputs,
            iterations: self.trajectory.len(),
            trajectory: std::mem::take(&mut self.trajectory),
            closing_reasoning,
            llm_calls: self.sub_queries.calls_used(),
            fallback,
        }
    }

    fn fatal(&mut self, cause: FatalCause) -> RunError {
        self.transition(SessionState::Fatal);
        error!(session_id = %self.id, cause = %cause, steps = self.trajectory.len(), "Session failed");
        RunError::Fatal {
            session_id: self.id.clone(),
            cause,
            trajectory: std::mem::take(&mut self.trajectory),
        }
    }

    /// Apply the configured fallback policy once the iteration budget is gone
    async fn exhausted(&mut self) -> Result<RunResult, RunError> {
        warn!(
            session_id = %self.id,
            iterations = self.trajectory.len(),
            policy = ?self.engine.config.fallback,
            "Iteration budget exhausted"
        );

        let recovered = match self.engine.config.fallback {
            FallbackPolicy::Fail => None,
            FallbackPolicy::LastReasoning => self.last_reasoning_fallback(),
            FallbackPolicy::Extract => self.extract_fallback().await,
        };

        match recovered {
            Some((outputs, reasoning, kind)) => {
                warn!(session_id = %self.id, fallback = ?kind, "Returning fallback outputs");
                Ok(self.finish(outputs, reasoning, Some(kind)))
            }
            None => Err(RunError::BudgetExhausted {
                session_id: self.id.clone(),
                llm_calls: self.sub_queries.calls_used(),
                trajectory: std::mem::take(&mut self.trajectory),
            }),
        }
    }

    fn last_reasoning_fallback(&self) -> Option<(Submission, String, FallbackKind)> {
        if self.engine.signature.outputs().len() != 1 {
            return None;
        }
        let reasoning = self.trajectory.last_reasoning()?.to_string();
        let raw = RawSubmission::Positional(vec![Value::String(reasoning.clone())]);
        let outputs = submission::validate(&self.engine.signature, raw).ok()?;
        Some((outputs, reasoning, FallbackKind::LastReasoning))
    }

    async fn extract_fallback(&self) -> Option<(Submission, String, FallbackKind)> {
        let messages = extract_messages(&self.engine.signature, &self.trajectory);
        let reply = match self.call_primary(&messages, self.trajectory.len()).await {
            Ok(reply) => reply,
            Err(cause) => {
                warn!(session_id = %self.id, cause = %cause, "Extraction call failed");
                return None;
            }
        };
        let value = parse_json_object(&reply)?;
        match submission::from_object(&self.engine.signature, value) {
            Ok(outputs) => Some((outputs, reply, FallbackKind::Extract)),
            Err(rejection) => {
                warn!(session_id = %self.id, reason = %rejection, "Extracted outputs rejected");
                None
            }
        }
    }
}

fn append_line(output: &mut String, line: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(line);
}
