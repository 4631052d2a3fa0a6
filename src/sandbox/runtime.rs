//! Boa interpreter setup and host functions
//!
//! Everything in this file runs on the sandbox thread. The Boa [`Context`]
//! is `!Send`, so it never leaves that thread; host functions reach back into
//! the Tokio runtime through a [`Handle`] and block until their future is done.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use boa_engine::{
    js_string, property::Attribute, Context, JsError, JsNativeError, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use super::output::OutputBuffer;
use super::{ExecutionOutcome, SandboxError};
use crate::config::{SandboxLimits, Timeouts};
use crate::submission::RawSubmission;
use crate::subquery::{SubQueryError, SubQueryService};
use crate::tools::{BuiltIn, Tool, ToolEntry, ToolRegistry};
use crate::trajectory::StepError;

/// Everything needed to build the interpreter; moved onto the sandbox thread
pub struct RuntimeSetup {
    pub inputs: Vec<(String, Value)>,
    pub tools: ToolRegistry,
    pub sub_queries: Arc<SubQueryService>,
    pub runtime: Handle,
    pub max_output_chars: usize,
    pub limits: SandboxLimits,
    pub timeouts: Timeouts,
}

/// Mutable state shared between the interpreter loop and host functions
struct HostState {
    output: OutputBuffer,
    submission: Option<RawSubmission>,
    /// Set by SUBMIT, a blown deadline or a fatal failure; every later host call throws
    halted: bool,
    deadline: Instant,
    timed_out: bool,
    /// Infrastructure failure that must end the session
    fatal: Option<String>,
}

impl HostState {
    fn begin(&mut self, deadline: Instant) {
        self.output.clear();
        self.submission = None;
        self.halted = false;
        self.deadline = deadline;
        self.timed_out = false;
        self.fatal = None;
    }
}

/// Handle to host state captured by every installed function
#[derive(Clone)]
struct Host {
    state: Rc<RefCell<HostState>>,
    runtime: Handle,
    sub_queries: Arc<SubQueryService>,
    execution_limit: Duration,
    tool_timeout: Duration,
}

impl Host {
    /// Refuse the call if execution already stopped; otherwise return the time left
    fn admit(&self, name: &str) -> JsResult<Duration> {
        let mut state = self.state.borrow_mut();
        if state.halted {
            return Err(halt(format!(
                "{} unavailable: execution of this code block has stopped",
                name
            )));
        }
        let now = Instant::now();
        if now >= state.deadline {
            state.timed_out = true;
            state.halted = true;
            return Err(self.deadline_error());
        }
        Ok(state.deadline - now)
    }

    fn deadline_error(&self) -> JsError {
        halt(format!(
            "Execution exceeded the {:.1}s time limit",
            self.execution_limit.as_secs_f64()
        ))
    }

    /// Drive a future on the Tokio runtime, bounded by the time left
    fn wait<F: Future>(&self, remaining: Duration, fut: F) -> JsResult<F::Output> {
        let result = self
            .runtime
            .block_on(async move { tokio::time::timeout(remaining, fut).await });
        result.map_err(|_| {
            let mut state = self.state.borrow_mut();
            state.timed_out = true;
            state.halted = true;
            self.deadline_error()
        })
    }

    fn sub_query_failure(&self, e: SubQueryError) -> JsError {
        if !e.is_recoverable() {
            let mut state = self.state.borrow_mut();
            state.fatal = Some(e.to_string());
            state.halted = true;
            return halt(e.to_string());
        }
        error(e.to_string())
    }

    fn print(&self, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        self.admit("print")?;
        let line = args
            .iter()
            .map(|v| display_value(v, ctx))
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.state.borrow_mut();
        state.output.push(&line);
        state.output.push("\n");
        Ok(JsValue::undefined())
    }

    fn llm_query(&self, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        let remaining = self.admit("llm_query")?;
        let prompt = match args.first() {
            Some(v) if !v.is_undefined() && !v.is_null() => display_value(v, ctx),
            _ => return Err(type_error("llm_query(prompt) requires a prompt string")),
        };

        let service = self.sub_queries.clone();
        match self.wait(remaining, async move { service.query(prompt).await })? {
            Ok(text) => Ok(JsValue::from(JsString::from(text.as_str()))),
            Err(e) => Err(self.sub_query_failure(e)),
        }
    }

    fn llm_query_batched(&self, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        let remaining = self.admit("llm_query_batched")?;
        let prompts = match args.first() {
            Some(v) if v.is_object() => match to_json(v, ctx)? {
                Value::Array(items) => items.into_iter().map(prompt_text).collect::<Vec<_>>(),
                _ => return Err(type_error("llm_query_batched(prompts) requires an array of prompts")),
            },
            _ => return Err(type_error("llm_query_batched(prompts) requires an array of prompts")),
        };

        let service = self.sub_queries.clone();
        let results = match self.wait(remaining, async move { service.query_batched(prompts).await })? {
            Ok(results) => results,
            Err(e) => return Err(self.sub_query_failure(e)),
        };

        let answers: Vec<Value> = results
            .into_iter()
            .map(|r| match r {
                Ok(text) => Value::String(text),
                Err(e) => Value::String(format!("[ERROR] {}", e)),
            })
            .collect();
        JsValue::from_json(&Value::Array(answers), ctx)
    }

    fn submit(&self, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        self.admit("SUBMIT")?;
        let values = args
            .iter()
            .map(|v| to_json(v, ctx))
            .collect::<JsResult<Vec<_>>>()?;

        let mut state = self.state.borrow_mut();
        state.submission = Some(RawSubmission::from_args(values));
        state.halted = true;
        Err(halt("SUBMIT called: execution of this code block stops here"))
    }

    fn call_tool(
        &self,
        name: &str,
        tool: &Arc<dyn Tool>,
        args: &[JsValue],
        ctx: &mut Context,
    ) -> JsResult<JsValue> {
        let remaining = self.admit(name)?;
        let values = args
            .iter()
            .map(|v| to_json(v, ctx))
            .collect::<JsResult<Vec<_>>>()?;

        debug!(tool = name, args = values.len(), "Invoking tool");
        let tool = tool.clone();
        let limit = self.tool_timeout;
        let outcome = self.wait(remaining, async move {
            tokio::time::timeout(limit, tool.invoke(values)).await
        })?;

        match outcome {
            Ok(Ok(value)) => JsValue::from_json(&value, ctx),
            Ok(Err(e)) => Err(error(format!("{} failed: {}", name, e))),
            Err(_) => Err(error(format!(
                "{} timed out after {:.1}s",
                name,
                limit.as_secs_f64()
            ))),
        }
    }
}

/// A Boa context with the registry's functions and the session inputs installed
pub struct JsRuntime {
    context: Context,
    state: Rc<RefCell<HostState>>,
    execution_limit: Duration,
}

impl JsRuntime {
    pub fn new(setup: RuntimeSetup) -> Result<Self, SandboxError> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(setup.limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(setup.limits.recursion_limit);

        let state = Rc::new(RefCell::new(HostState {
            output: OutputBuffer::new(setup.max_output_chars),
            submission: None,
            halted: false,
            deadline: Instant::now(),
            timed_out: false,
            fatal: None,
        }));
        let host = Host {
            state: state.clone(),
            runtime: setup.runtime,
            sub_queries: setup.sub_queries,
            execution_limit: setup.timeouts.sandbox_execution,
            tool_timeout: setup.timeouts.tool_call,
        };

        let mut protected = Vec::new();
        for (name, entry) in setup.tools.iter() {
            install(&mut context, name, entry, &host)
                .map_err(|e| SandboxError::Init(format!("installing {}: {}", name, e)))?;
            protected.push(name.to_string());
        }

        let prelude = prelude(&protected);
        context
            .eval(Source::from_bytes(prelude.as_str()))
            .map_err(|e| SandboxError::Init(format!("prelude: {}", e)))?;

        for (name, value) in &setup.inputs {
            let js = JsValue::from_json(value, &mut context)
                .map_err(|e| SandboxError::Init(format!("input {}: {}", name, e)))?;
            context
                .register_global_property(JsString::from(name.as_str()), js, Attribute::all())
                .map_err(|e| SandboxError::Init(format!("input {}: {}", name, e)))?;
        }

        Ok(Self {
            context,
            state,
            execution_limit: setup.timeouts.sandbox_execution,
        })
    }

    /// Run one code block against the persistent global scope
    pub fn execute(&mut self, code: &str, deadline: Instant) -> Result<ExecutionOutcome, SandboxError> {
        self.state.borrow_mut().begin(deadline);
        let started = Instant::now();

        let result = self.context.eval(Source::from_bytes(code));
        self.context.run_jobs();
        let thrown = match &result {
            Ok(_) => None,
            Err(e) => Some(describe_error(e, &mut self.context)),
        };
        let duration = started.elapsed();

        let mut state = self.state.borrow_mut();
        if let Some(cause) = state.fatal.take() {
            return Err(SandboxError::SubModel(cause));
        }

        let output = state.output.take();
        let submission = state.submission.take();
        let error = if submission.is_some() {
            None
        } else if state.timed_out {
            Some(StepError::Timeout(format!(
                "Execution exceeded the {:.1}s time limit",
                self.execution_limit.as_secs_f64()
            )))
        } else {
            thrown.map(|message| {
                if is_limit_error(&message) {
                    StepError::Timeout(message)
                } else {
                    StepError::Runtime(message)
                }
            })
        };

        Ok(ExecutionOutcome {
            output: output.text,
            truncated: output.truncated,
            total_chars: output.total_chars,
            submission,
            error,
            duration,
        })
    }
}

fn install(context: &mut Context, name: &str, entry: &ToolEntry, host: &Host) -> JsResult<()> {
    let host = host.clone();
    // SAFETY: the closures capture only Rust-owned data (Rc, Arc, Handle,
    // Strings); no garbage-collected value is held across collections.
    let body = unsafe {
        match entry {
            ToolEntry::BuiltIn(BuiltIn::Print) => {
                NativeFunction::from_closure(move |_, args, ctx| host.print(args, ctx))
            }
            ToolEntry::BuiltIn(BuiltIn::LlmQuery) => {
                NativeFunction::from_closure(move |_, args, ctx| host.llm_query(args, ctx))
            }
            ToolEntry::BuiltIn(BuiltIn::LlmQueryBatched) => {
                NativeFunction::from_closure(move |_, args, ctx| host.llm_query_batched(args, ctx))
            }
            ToolEntry::BuiltIn(BuiltIn::Submit) => {
                NativeFunction::from_closure(move |_, args, ctx| host.submit(args, ctx))
            }
            ToolEntry::User(tool) => {
                let tool = tool.clone();
                let tool_name = name.to_string();
                NativeFunction::from_closure(move |_, args, ctx| {
                    host.call_tool(&tool_name, &tool, args, ctx)
                })
            }
        }
    };
    context.register_global_callable(JsString::from(name), 0, body)
}

/// `console.log` alias plus read-only bindings for every registered function
fn prelude(protected: &[String]) -> String {
    let names = serde_json::to_string(protected).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"var console = {{ log: print, info: print, warn: print, error: print }};
(function (names) {{
  for (var i = 0; i < names.length; i++) {{
    Object.defineProperty(globalThis, names[i], {{ writable: false, configurable: false }});
  }}
}})({});"#,
        names
    )
}

/// Stops the whole code block; `try`/`catch` in the script cannot intercept it
fn halt(message: impl Into<String>) -> JsError {
    JsNativeError::runtime_limit().with_message(message.into()).into()
}

fn error(message: impl Into<String>) -> JsError {
    JsNativeError::error().with_message(message.into()).into()
}

fn type_error(message: &str) -> JsError {
    JsNativeError::typ().with_message(message.to_string()).into()
}

fn describe_error(err: &JsError, ctx: &mut Context) -> String {
    match err.try_native(ctx) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    }
}

/// Interpreter loop and recursion limits surface as `RuntimeLimit` errors
fn is_limit_error(message: &str) -> bool {
    message.starts_with("RuntimeLimit")
        || message.contains("loop iteration limit")
        || message.contains("recursion limit")
}

fn prompt_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// `JSON.stringify(value)`, or None when the value has no JSON form
fn stringify(value: &JsValue, ctx: &mut Context) -> JsResult<Option<String>> {
    let global = ctx.global_object();
    let json = global.get(js_string!("JSON"), ctx)?;
    let func = match json.as_object() {
        Some(obj) => obj.get(js_string!("stringify"), ctx)?,
        None => JsValue::undefined(),
    };
    let Some(func) = func.as_callable() else {
        return Err(type_error("JSON.stringify is not available"));
    };
    let text = func.call(&JsValue::undefined(), &[value.clone()], ctx)?;
    Ok(text.as_string().map(|s| s.to_std_string_escaped()))
}

/// Convert a script value to JSON; `undefined` and functions become null
fn to_json(value: &JsValue, ctx: &mut Context) -> JsResult<Value> {
    match stringify(value, ctx)? {
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            JsNativeError::typ()
                .with_message(format!("value is not JSON serializable: {}", e))
                .into()
        }),
        None => Ok(Value::Null),
    }
}

/// Text `print` writes for a value: strings raw, objects as JSON
fn display_value(value: &JsValue, ctx: &mut Context) -> String {
    if let Some(s) = value.as_string() {
        return s.to_std_string_escaped();
    }
    if value.is_object() && !value.is_callable() {
        if let Ok(Some(json)) = stringify(value, ctx) {
            return json;
        }
    }
    match value.to_string(ctx) {
        Ok(s) => s.to_std_string_escaped(),
        Err(_) => value.display().to_string(),
    }
}
