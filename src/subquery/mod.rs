//! Sub-Query Service - `llm_query` and `llm_query_batched`
//!
//! Sandboxed code delegates semantic sub-tasks to the secondary model through
//! this service. It owns the session's sub-call budget.
//!
//! # Budget Accounting
//!
//! ```text
//! llm_query(p)                 reserve(1) ──► call ──► text
//! llm_query_batched([p0..pn])  reserve(n+1) ──► n+1 calls, concurrent
//!                                   │
//!                                   └─ would exceed max? ──► reject all,
//!                                                            zero calls made
//! ```
//!
//! Reservation is a single compare-and-swap on the used counter, so a batch
//! either gets all of its units or none of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info_span, warn, Instrument};

use crate::metrics::{SUB_QUERIES, SUB_QUERY_REJECTIONS};
use crate::model::{ChatMessage, LanguageModel, ModelError};

/// Error type for sub-query operations
#[derive(Debug)]
pub enum SubQueryError {
    /// The request needs more calls than remain in the budget
    BudgetExhausted {
        requested: usize,
        used: usize,
        max: usize,
    },
    /// A prompt exceeds the secondary model's capacity
    PromptTooLarge {
        index: usize,
        chars: usize,
        limit: usize,
    },
    /// The secondary model did not answer in time
    Timeout(Duration),
    /// The secondary model failed after its own retries
    Model(ModelError),
}

impl SubQueryError {
    /// Errors the script can react to; everything else ends the session
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SubQueryError::Model(_))
    }
}

impl std::fmt::Display for SubQueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubQueryError::BudgetExhausted { requested, used, max } => write!(
                f,
                "LLM call budget exhausted: requested {} call(s), {} of {} already used",
                requested, used, max
            ),
            SubQueryError::PromptTooLarge { index, chars, limit } => write!(
                f,
                "Prompt {} is {} chars, over the {} char limit of the sub-model; split it into smaller pieces",
                index, chars, limit
            ),
            SubQueryError::Timeout(d) => {
                write!(f, "Sub-model call timed out after {:.1}s", d.as_secs_f64())
            }
            SubQueryError::Model(e) => write!(f, "Sub-model call failed: {}", e),
        }
    }
}

impl std::error::Error for SubQueryError {}

impl From<ModelError> for SubQueryError {
    fn from(e: ModelError) -> Self {
        SubQueryError::Model(e)
    }
}

/// Budgeted access to the secondary model for one session
pub struct SubQueryService {
    model: Arc<dyn LanguageModel>,
    max_calls: usize,
    used: AtomicUsize,
    max_prompt_chars: usize,
    call_timeout: Duration,
}

impl SubQueryService {
    /// Create a service with its own, empty, call counter
    ///
    /// # Arguments
    /// * `model` - The secondary model
    /// * `max_calls` - Hard ceiling on calls for the session
    /// * `max_prompt_chars` - Largest accepted prompt
    /// * `call_timeout` - Timeout applied to each individual call
    pub fn new(
        model: Arc<dyn LanguageModel>,
        max_calls: usize,
        max_prompt_chars: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            max_calls,
            used: AtomicUsize::new(0),
            max_prompt_chars,
            call_timeout,
        }
    }

    /// Calls consumed so far
    pub fn calls_used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Claim `n` units of budget, all or nothing
    fn reserve(&self, n: usize) -> Result<(), SubQueryError> {
        let result = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(n).filter(|total| *total <= self.max_calls)
            });

        result.map(|_| ()).map_err(|used| {
            SUB_QUERY_REJECTIONS.with_label_values(&["budget"]).inc();
            warn!(requested = n, used, max = self.max_calls, "Sub-query budget exhausted");
            SubQueryError::BudgetExhausted {
                requested: n,
                used,
                max: self.max_calls,
            }
        })
    }

    fn check_sizes(&self, prompts: &[String]) -> Result<(), SubQueryError> {
        for (index, prompt) in prompts.iter().enumerate() {
            let chars = prompt.chars().count();
            if chars > self.max_prompt_chars {
                SUB_QUERY_REJECTIONS
                    .with_label_values(&["prompt_too_large"])
                    .inc();
                return Err(SubQueryError::PromptTooLarge {
                    index,
                    chars,
                    limit: self.max_prompt_chars,
                });
            }
        }
        Ok(())
    }

    /// One blocking round-trip to the secondary model
    pub async fn query(&self, prompt: String) -> Result<String, SubQueryError> {
        self.check_sizes(std::slice::from_ref(&prompt))?;
        self.reserve(1)?;
        self.call(prompt)
            .instrument(info_span!("sub_query", model = %self.model.name(), batch = false))
            .await
    }

    /// Answer every prompt concurrently; element `i` answers `prompts[i]`
    ///
    /// The whole batch is rejected up front if any prompt is too large or the
    /// batch does not fit in the remaining budget. Per-element timeouts are
    /// returned in their slot; a model failure fails the whole call.
    pub async fn query_batched(
        &self,
        prompts: Vec<String>,
    ) -> Result<Vec<Result<String, SubQueryError>>, SubQueryError> {
        self.check_sizes(&prompts)?;
        self.reserve(prompts.len())?;
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let span = info_span!("sub_query", model = %self.model.name(), batch = true, size = prompts.len());
        let results = join_all(prompts.into_iter().map(|p| self.call(p)))
            .instrument(span)
            .await;

        let mut answers = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Err(SubQueryError::Model(e)) => return Err(SubQueryError::Model(e)),
                other => answers.push(other),
            }
        }
        Ok(answers)
    }

    async fn call(&self, prompt: String) -> Result<String, SubQueryError> {
        let messages = [ChatMessage::user(prompt)];
        match tokio::time::timeout(self.call_timeout, self.model.complete(&messages)).await {
            Ok(Ok(text)) => {
                SUB_QUERIES.with_label_values(&["ok"]).inc();
                debug!(chars = text.len(), "Sub-query answered");
                Ok(text)
            }
            Ok(Err(e)) => {
                SUB_QUERIES.with_label_values(&["error"]).inc();
                warn!(error = %e, "Sub-query failed");
                Err(SubQueryError::Model(e))
            }
            Err(_) => {
                SUB_QUERIES.with_label_values(&["timeout"]).inc();
                warn!(timeout_secs = self.call_timeout.as_secs_f64(), "Sub-query timed out");
                Err(SubQueryError::Timeout(self.call_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnModel, ScriptedModel};

    fn service(model: Arc<dyn LanguageModel>, max_calls: usize) -> SubQueryService {
        SubQueryService::new(model, max_calls, 1_000, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_query_consumes_budget() {
        let svc = service(Arc::new(FnModel::new(|p| format!("re: {}", p))), 2);

        assert_eq!(svc.query("a".into()).await.unwrap(), "re: a");
        assert_eq!(svc.query("b".into()).await.unwrap(), "re: b");
        assert_eq!(svc.calls_used(), 2);

        let err = svc.query("c".into()).await.unwrap_err();
        assert!(matches!(err, SubQueryError::BudgetExhausted { requested: 1, used: 2, max: 2 }));
        assert!(err.is_recoverable());
        assert_eq!(svc.calls_used(), 2);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_despite_completion_order() {
        // Earlier prompts take longer, so completion order is reversed
        let model = FnModel::new(|p| p.to_uppercase()).with_delay(|p| match p {
            "p0" => Duration::from_millis(60),
            "p1" => Duration::from_millis(30),
            _ => Duration::from_millis(1),
        });
        let svc = service(Arc::new(model), 10);

        let results = svc
            .query_batched(vec!["p0".into(), "p1".into(), "p2".into()])
            .await
            .unwrap();
        let texts: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["P0", "P1", "P2"]);
        assert_eq!(svc.calls_used(), 3);
    }

    #[tokio::test]
    async fn test_batch_over_budget_runs_nothing() {
        let model = Arc::new(ScriptedModel::new(["x", "y", "z"]));
        let svc = service(model.clone(), 2);

        let err = svc
            .query_batched(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SubQueryError::BudgetExhausted { requested: 3, .. }));
        assert_eq!(svc.calls_used(), 0);
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_too_large_is_rejected_without_budget() {
        let svc = SubQueryService::new(
            Arc::new(FnModel::new(|p| p.to_string())),
            5,
            10,
            Duration::from_secs(1),
        );
        let err = svc.query("x".repeat(11)).await.unwrap_err();
        assert!(matches!(err, SubQueryError::PromptTooLarge { chars: 11, limit: 10, .. }));
        assert_eq!(svc.calls_used(), 0);

        let err = svc
            .query_batched(vec!["ok".into(), "y".repeat(20)])
            .await
            .unwrap_err();
        assert!(matches!(err, SubQueryError::PromptTooLarge { index: 1, .. }));
        assert_eq!(svc.calls_used(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable() {
        let model = FnModel::new(|p| p.to_string()).with_delay(|_| Duration::from_millis(200));
        let svc = SubQueryService::new(Arc::new(model), 5, 100, Duration::from_millis(20));

        let err = svc.query("slow".into()).await.unwrap_err();
        assert!(matches!(err, SubQueryError::Timeout(_)));
        assert!(err.is_recoverable());
        assert_eq!(svc.calls_used(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_is_not_recoverable() {
        let model = ScriptedModel::new(Vec::<String>::new()).then_fail("backend down");
        let svc = service(Arc::new(model), 5);
        let err = svc.query("q".into()).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let svc = service(Arc::new(FnModel::new(|p| p.to_string())), 0);
        assert!(svc.query_batched(Vec::new()).await.unwrap().is_empty());
    }
}
