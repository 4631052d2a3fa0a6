//! Sandbox thread lifecycle and request dispatch

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::runtime::{JsRuntime, RuntimeSetup};
use super::{ExecutionOutcome, SandboxError};
use crate::config::Timeouts;
use crate::metrics::{SANDBOX_EXECUTIONS, SANDBOX_EXECUTION_DURATION};

struct Request {
    code: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<ExecutionOutcome, SandboxError>>,
}

/// Owner-side handle to a session's sandbox thread
///
/// Dropping the handle closes the request channel and the thread exits after
/// its current execution. A thread stuck past its hard deadline is detached:
/// Boa offers no way to interrupt a running script, so a nested loop with no
/// host calls keeps its CPU core busy until the per-loop limits end it, even
/// after the session has failed.
pub struct SandboxHandle {
    requests: mpsc::Sender<Request>,
    timeouts: Timeouts,
    /// Set once the thread missed a hard deadline; it may still be running
    wedged: AtomicBool,
}

impl SandboxHandle {
    /// Start the sandbox thread and wait for the interpreter to be ready
    pub async fn start(session_id: &str, setup: RuntimeSetup) -> Result<Self, SandboxError> {
        let timeouts = setup.timeouts;
        let (tx, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SandboxError>>();

        std::thread::Builder::new()
            .name(format!("sandbox-{}", short_id(session_id)))
            .spawn(move || serve(setup, ready_tx, rx))
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(session_id, "Sandbox ready");
                Ok(Self {
                    requests: tx,
                    timeouts,
                    wedged: AtomicBool::new(false),
                })
            }
            Ok(Err(e)) => {
                error!(session_id, error = %e, "Sandbox initialization failed");
                Err(e)
            }
            Err(_) => Err(SandboxError::Init(
                "sandbox thread exited during startup".to_string(),
            )),
        }
    }

    /// Run one code block
    ///
    /// Recoverable failures (exceptions, soft timeouts) come back inside the
    /// outcome; an `Err` means the sandbox itself can no longer be trusted.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome, SandboxError> {
        let hard_limit = self.timeouts.sandbox_execution + self.timeouts.sandbox_grace;
        if self.wedged.load(Ordering::SeqCst) {
            return Err(SandboxError::Unresponsive(hard_limit));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            code: code.to_string(),
            deadline: Instant::now() + self.timeouts.sandbox_execution,
            reply: reply_tx,
        };
        self.requests
            .send(request)
            .map_err(|_| SandboxError::Unavailable)?;

        let timer = SANDBOX_EXECUTION_DURATION.start_timer();
        let result = match tokio::time::timeout(hard_limit, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::Unavailable),
            Err(_) => {
                self.wedged.store(true, Ordering::SeqCst);
                warn!(
                    limit_secs = hard_limit.as_secs_f64(),
                    "Sandbox missed its hard deadline"
                );
                Err(SandboxError::Unresponsive(hard_limit))
            }
        };
        timer.observe_duration();

        match &result {
            Ok(outcome) => {
                SANDBOX_EXECUTIONS.with_label_values(&[outcome.status()]).inc();
                debug!(
                    status = outcome.status(),
                    output_chars = outcome.total_chars,
                    duration_ms = outcome.duration.as_secs_f64() * 1000.0,
                    "Execution finished"
                );
            }
            Err(_) => SANDBOX_EXECUTIONS.with_label_values(&["fatal"]).inc(),
        }
        result
    }
}

/// Sandbox thread body
fn serve(
    setup: RuntimeSetup,
    ready: oneshot::Sender<Result<(), SandboxError>>,
    requests: mpsc::Receiver<Request>,
) {
    let mut runtime = match JsRuntime::new(setup) {
        Ok(runtime) => {
            let _ = ready.send(Ok(()));
            runtime
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(request) = requests.recv() {
        let result = runtime.execute(&request.code, request.deadline);
        // The driver may have given up waiting
        let _ = request.reply.send(result);
    }
}

fn short_id(session_id: &str) -> &str {
    let start = session_id.len().saturating_sub(8);
    session_id.get(start..).unwrap_or(session_id)
}
