//! Trajectory Recorder - append-only audit trail of a session
//!
//! Every iteration appends exactly one [`Step`]. Steps are never edited once
//! recorded; insertion order is the causal order of iterations.

pub mod store;

use serde::{Deserialize, Serialize};

pub use store::{RunRecord, RunSummary, TrajectoryStore};

/// Recoverable problem observed during one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StepError {
    /// The code threw (syntax error, runtime error, tool or sub-query failure)
    Runtime(String),
    /// The code ran past the execution deadline
    Timeout(String),
    /// SUBMIT was called with arguments that do not match the output contract
    InvalidSubmission(String),
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepError::Runtime(msg) => write!(f, "runtime error: {}", msg),
            StepError::Timeout(msg) => write!(f, "timeout: {}", msg),
            StepError::InvalidSubmission(msg) => write!(f, "invalid submission: {}", msg),
        }
    }
}

/// Record of a single iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 0-based iteration index
    pub index: usize,
    /// Text the primary model wrote before its code
    pub reasoning: String,
    /// Code submitted for execution (empty for a pure reasoning turn)
    pub code: String,
    /// Captured output, possibly truncated
    pub output: String,
    /// Whether `output` was cut at the output budget
    pub truncated: bool,
    pub error: Option<StepError>,
    /// Execution wall time in milliseconds
    pub duration_ms: f64,
}

impl Step {
    /// Reasoning-only turn: nothing was executed
    pub fn reasoning_only(index: usize, reasoning: impl Into<String>) -> Self {
        Self {
            index,
            reasoning: reasoning.into(),
            code: String::new(),
            output: String::new(),
            truncated: false,
            error: None,
            duration_ms: 0.0,
        }
    }
}

/// Ordered, append-only sequence of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    steps: Vec<Step>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next step; its index must follow the previous one
    pub(crate) fn push(&mut self, step: Step) {
        debug_assert_eq!(step.index, self.steps.len(), "steps must be appended in order");
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// Most recent non-empty reasoning text
    pub fn last_reasoning(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .map(|s| s.reasoning.trim())
            .find(|r| !r.is_empty())
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, reasoning: &str) -> Step {
        Step {
            index,
            reasoning: reasoning.to_string(),
            code: "print(1)".to_string(),
            output: "1\n".to_string(),
            truncated: false,
            error: None,
            duration_ms: 1.0,
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let mut t = Trajectory::new();
        t.push(step(0, "look"));
        t.push(step(1, "answer"));
        assert_eq!(t.len(), 2);
        assert_eq!(t.steps()[0].reasoning, "look");
        assert_eq!(t.last().unwrap().index, 1);
    }

    #[test]
    fn test_last_reasoning_skips_blank() {
        let mut t = Trajectory::new();
        t.push(step(0, "first thought"));
        t.push(step(1, "   "));
        assert_eq!(t.last_reasoning(), Some("first thought"));
        assert_eq!(Trajectory::new().last_reasoning(), None);
    }

    #[test]
    fn test_step_error_serialization() {
        let err = StepError::InvalidSubmission("missing answer".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"kind":"invalid_submission","message":"missing answer"}"#);
    }

    #[test]
    fn test_trajectory_json_preserves_durations() {
        let mut t = Trajectory::new();
        let mut timed = step(0, "look");
        timed.duration_ms = 12.75;
        t.push(timed);
        let restored: Trajectory = serde_json::from_str(&serde_json::to_string(&t).unwrap()).unwrap();
        assert_eq!(restored, t);
        assert_eq!(restored.steps()[0].duration_ms, 12.75);
    }
}
