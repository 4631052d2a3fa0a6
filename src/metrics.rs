//! Prometheus metrics for the execution engine
//!
//! All metrics live in the default registry; [`render`] produces the text
//! exposition format for scraping or printing.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Session Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished sessions by terminal status.
    ///
    /// Labels:
    /// - status: "completed", "fallback", "budget_exhausted", "fatal", "config_error"
    pub static ref SESSIONS: CounterVec = register_counter_vec!(
        "rlm_sessions_total",
        "Finished sessions by terminal status",
        &["status"]
    ).expect("failed to register SESSIONS metric");

    /// Iterations consumed per finished session.
    pub static ref SESSION_ITERATIONS: Histogram = register_histogram!(
        "rlm_session_iterations",
        "Iterations consumed per session",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 20.0, 50.0]
    ).expect("failed to register SESSION_ITERATIONS metric");

    /// Primary model call latency in seconds.
    ///
    /// Labels:
    /// - model: primary model name
    pub static ref PRIMARY_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "rlm_primary_call_duration_seconds",
        "Primary model call latency",
        &["model"]
    ).expect("failed to register PRIMARY_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox executions by outcome.
    ///
    /// Labels:
    /// - status: "ok", "error", "timeout", "submitted", "fatal"
    pub static ref SANDBOX_EXECUTIONS: CounterVec = register_counter_vec!(
        "rlm_sandbox_executions_total",
        "Sandbox executions by outcome",
        &["status"]
    ).expect("failed to register SANDBOX_EXECUTIONS metric");

    /// Sandbox execution wall time in seconds.
    pub static ref SANDBOX_EXECUTION_DURATION: Histogram = register_histogram!(
        "rlm_sandbox_execution_duration_seconds",
        "Sandbox execution wall time"
    ).expect("failed to register SANDBOX_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sub-Query Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sub-model calls by outcome.
    ///
    /// Labels:
    /// - status: "ok", "timeout", "error"
    pub static ref SUB_QUERIES: CounterVec = register_counter_vec!(
        "rlm_sub_queries_total",
        "Sub-model calls by outcome",
        &["status"]
    ).expect("failed to register SUB_QUERIES metric");

    /// Sub-query requests rejected before dispatch.
    ///
    /// Labels:
    /// - reason: "budget", "prompt_too_large"
    pub static ref SUB_QUERY_REJECTIONS: CounterVec = register_counter_vec!(
        "rlm_sub_query_rejections_total",
        "Sub-query requests rejected before dispatch",
        &["reason"]
    ).expect("failed to register SUB_QUERY_REJECTIONS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        SESSIONS.with_label_values(&["completed"]).inc_by(0.0);
        SUB_QUERY_REJECTIONS.with_label_values(&["budget"]).inc_by(0.0);
        let text = render();
        assert!(text.contains("rlm_sessions_total"));
        assert!(text.contains("rlm_sub_query_rejections_total"));
    }
}
