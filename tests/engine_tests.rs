//! Integration tests for the engine
//!
//! These drive full sessions with offline models: a scripted primary model
//! replays fixed replies and a closure-backed model stands in for the
//! sub-model. The one test that needs a live Ollama server is #[ignore]d.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use rlm_engine::engine::FatalCause;
use rlm_engine::sandbox::SandboxError;
use rlm_engine::{
    ConfigError, Engine, EngineConfig, FallbackKind, FallbackPolicy, FnModel, Inputs, RunError,
    ScriptedModel, SessionState, Signature, StepError, Tool, ToolError,
};

fn js(code: &str) -> String {
    format!("```javascript\n{}\n```", code)
}

fn reasoned(reasoning: &str, code: &str) -> String {
    format!("{}\n{}", reasoning, js(code))
}

fn config(max_iterations: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.budgets.max_iterations = max_iterations;
    config
}

fn sky_inputs() -> Inputs {
    Inputs::new()
        .with("document", "The sky is blue.")
        .with("query", "What color is the sky?")
}

struct SearchDb;

#[async_trait]
impl Tool for SearchDb {
    fn description(&self) -> &str {
        "search_db(term) -> matching rows"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, ToolError> {
        match args.first().and_then(Value::as_str) {
            Some("") | None => Err(ToolError::new("empty search term")),
            Some(term) => Ok(json!([format!("row about {}", term)])),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_inspect_then_submit() {
    let primary = Arc::new(ScriptedModel::new([
        reasoned("Let me read the document.", "print(document)"),
        reasoned("The document says blue.", "SUBMIT(answer=\"blue\")"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary.clone(),
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.outputs.get_str("answer"), Some("blue"));
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.trajectory.len(), 2);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.closing_reasoning, "The document says blue.");
    assert!(result.fallback.is_none());
    assert_eq!(result.trajectory.steps()[0].output, "The sky is blue.\n");

    // The second turn sees the first step's output
    let requests = primary.requests();
    assert_eq!(requests.len(), 2);
    let observation = &requests[1].last().unwrap().content;
    assert!(observation.contains("The sky is blue."));
    assert!(observation.contains("turn(s) remaining"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_budget_exhausted_without_submit() {
    let primary = Arc::new(ScriptedModel::new([js("print(document.length)")]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary.clone(),
        config(1),
    );

    let err = engine.run(sky_inputs()).await.unwrap_err();

    assert_eq!(err.status(), SessionState::BudgetExhausted);
    assert_eq!(err.trajectory().map(|t| t.len()), Some(1));
    assert!(err.session_id().is_some());
    // No second primary call once the budget is gone
    assert_eq!(primary.requests().len(), 1);
    match err {
        RunError::BudgetExhausted { llm_calls, .. } => assert_eq!(llm_calls, 0),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_variables_persist_across_iterations() {
    let primary = Arc::new(ScriptedModel::new([
        js("var words = document.split(' ');\nvar count = words.length;"),
        js("print(count, words[3])"),
        js("SUBMIT(String(count))"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.steps()[1].output, "4 blue.\n");
    assert_eq!(result.outputs.get_str("answer"), Some("4"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reasoning_only_step_consumes_an_iteration() {
    let primary = Arc::new(ScriptedModel::new([
        "I should think before writing code.".to_string(),
        js("SUBMIT('blue')"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary.clone(),
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.len(), 2);
    let first = &result.trajectory.steps()[0];
    assert!(first.code.is_empty());
    assert!(first.output.is_empty());
    assert!(first.error.is_none());
    assert_eq!(first.reasoning, "I should think before writing code.");
    let requests = primary.requests();
    let nudge = &requests[1].last().unwrap().content;
    assert!(nudge.contains("No code was run"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors inside the sandbox are observations, not failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_runtime_error_is_recoverable() {
    let primary = Arc::new(ScriptedModel::new([
        js("print(undefined_variable)"),
        js("SUBMIT('recovered')"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    let first = &result.trajectory.steps()[0];
    assert!(matches!(first.error, Some(StepError::Runtime(_))));
    assert!(first.output.contains("[Error]"));
    assert!(first.output.contains("undefined_variable"));
    assert_eq!(result.outputs.get_str("answer"), Some("recovered"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_truncation_marker() {
    let primary = Arc::new(ScriptedModel::new([
        js("print('x'.repeat(500))"),
        js("SUBMIT('done')"),
    ]));
    let mut config = config(5);
    config.budgets.max_output_chars = 100;
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config,
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    let step = &result.trajectory.steps()[0];
    assert!(step.truncated);
    assert!(step.output.starts_with(&"x".repeat(100)));
    assert!(step
        .output
        .contains("[output truncated: showing 100 of 501 characters]"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_positional_submit_rejected_for_two_fields() {
    let primary = Arc::new(ScriptedModel::new([
        js("SUBMIT('blue', 'doc1')"),
        js("SUBMIT({answer: 'blue', sources: ['doc1']})"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer, sources").unwrap(),
        primary.clone(),
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.len(), 2);
    let rejected = &result.trajectory.steps()[0];
    assert!(matches!(rejected.error, Some(StepError::InvalidSubmission(_))));
    assert!(rejected.output.contains("answer, sources"));
    let requests = primary.requests();
    assert!(requests[1].last().unwrap().content.contains("Positional submission"));

    assert_eq!(result.outputs.get_str("answer"), Some("blue"));
    assert_eq!(result.outputs.get("sources"), Some(&json!(["doc1"])));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_with_missing_field_is_rejected() {
    let primary = Arc::new(ScriptedModel::new([
        js("SUBMIT({answer: 'blue'})"),
        js("SUBMIT({answer: 'blue', sources: []})"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer, sources").unwrap(),
        primary,
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    let rejected = &result.trajectory.steps()[0];
    assert!(rejected.output.contains("missing output field(s): sources"));
    assert_eq!(result.outputs.get("sources"), Some(&json!([])));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_code_after_submit_does_not_run() {
    let primary = Arc::new(ScriptedModel::new([js(
        "print('before');\ntry { SUBMIT('blue'); } catch (e) {}\nprint('after');",
    )]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(3),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.len(), 1);
    assert_eq!(result.trajectory.steps()[0].output, "before\n");
    assert_eq!(result.outputs.get_str("answer"), Some("blue"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_field_submit_with_extra_key_is_rejected() {
    let primary = Arc::new(ScriptedModel::new([
        js("SUBMIT({answer: 'blue', confidence: 0.9})"),
        js("SUBMIT({answer: 'blue'})"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.len(), 2);
    let rejected = &result.trajectory.steps()[0];
    assert!(matches!(rejected.error, Some(StepError::InvalidSubmission(_))));
    assert!(rejected.output.contains("unexpected field(s): confidence"));
    assert_eq!(result.outputs.get("answer"), Some(&json!("blue")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_caught_submit_leaves_no_bindings() {
    let primary = Arc::new(ScriptedModel::new([
        js("try { SUBMIT('only one'); } catch (e) {}\nvar leaked = 42;\nglobalThis.also_leaked = 1;"),
        js("print(typeof leaked, typeof also_leaked)"),
        js("SUBMIT({answer: 'blue', sources: []})"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer, sources").unwrap(),
        primary,
        config(5),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.trajectory.len(), 3);
    assert!(matches!(
        result.trajectory.steps()[0].error,
        Some(StepError::InvalidSubmission(_))
    ));
    assert_eq!(result.trajectory.steps()[1].output, "undefined undefined\n");
}

// ─────────────────────────────────────────────────────────────────────────────
// Sub-queries
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_query_uses_sub_model() {
    let primary = Arc::new(ScriptedModel::new([js(
        "var color = llm_query('Color in: ' + document);\nSUBMIT(color)",
    )]));
    let sub = Arc::new(FnModel::new(|prompt| {
        if prompt.contains("blue") {
            "blue".to_string()
        } else {
            "unknown".to_string()
        }
    }));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(3),
    )
    .with_sub_model(sub);

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.outputs.get_str("answer"), Some("blue"));
    assert_eq!(result.llm_calls, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_query_batched_preserves_order() {
    let primary = Arc::new(ScriptedModel::new([js(
        "var out = llm_query_batched(['a', 'bb', 'ccc', 'dddd']);\nSUBMIT(out.join(','))",
    )]));
    // Shorter prompts take longer, so completion order is the reverse of request order
    let sub = Arc::new(
        FnModel::new(|prompt| prompt.to_uppercase())
            .with_delay(|prompt| Duration::from_millis(80 / prompt.len() as u64)),
    );
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(3),
    )
    .with_sub_model(sub);

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.outputs.get_str("answer"), Some("A,BB,CCC,DDDD"));
    assert_eq!(result.llm_calls, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_llm_call_budget_never_exceeded() {
    let primary = Arc::new(ScriptedModel::new([js(
        "var seen = [];\n\
         for (var i = 0; i < 3; i++) {\n\
           try { seen.push(llm_query('q' + i)); } catch (e) { print(String(e)); }\n\
         }\n\
         try { llm_query_batched(['x', 'y']); } catch (e) { print(String(e)); }\n\
         SUBMIT(seen.join(','))",
    )]));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sub = Arc::new(FnModel::new(move |prompt| {
        counter.fetch_add(1, Ordering::SeqCst);
        format!("ok:{}", prompt)
    }));
    let mut config = config(3);
    config.budgets.max_llm_calls = 2;
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config,
    )
    .with_sub_model(sub);

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.llm_calls, 2);
    assert_eq!(result.outputs.get_str("answer"), Some("ok:q0,ok:q1"));
    let output = &result.trajectory.steps()[0].output;
    assert_eq!(output.matches("budget exhausted").count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batched_slot_timeout_is_reported_in_place() {
    let primary = Arc::new(ScriptedModel::new([js(
        "var r = llm_query_batched(['fast', 'slow', 'fast again']);\nSUBMIT(r.join(' | '))",
    )]));
    let sub = Arc::new(
        FnModel::new(|prompt| prompt.to_uppercase()).with_delay(|prompt| {
            if prompt == "slow" {
                Duration::from_secs(5)
            } else {
                Duration::ZERO
            }
        }),
    );
    let mut config = config(3);
    config.timeouts.sub_call = Duration::from_millis(200);
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config,
    )
    .with_sub_model(sub);

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(
        result.outputs.get_str("answer"),
        Some("FAST | [ERROR] Sub-model call timed out after 0.2s | FAST AGAIN")
    );
    assert_eq!(result.llm_calls, 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_tool_named_like_builtin_is_rejected() {
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        Arc::new(ScriptedModel::new(Vec::<String>::new())),
        EngineConfig::default(),
    );

    let err = engine.with_tool("print", Arc::new(SearchDb)).err();
    assert_eq!(err, Some(ConfigError::ReservedToolName("print".to_string())));
}

#[test]
fn test_tool_shadowing_a_field_is_rejected() {
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        Arc::new(ScriptedModel::new(Vec::<String>::new())),
        EngineConfig::default(),
    );

    let err = engine.with_tool("document", Arc::new(SearchDb)).err();
    assert_eq!(err, Some(ConfigError::ToolShadowsField("document".to_string())));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_tool_is_callable() {
    let primary = Arc::new(ScriptedModel::new([
        js("print(search_db('sky')[0]);\ntry { search_db(''); } catch (e) { print(String(e)); }"),
        js("SUBMIT(search_db('sky')[0])"),
    ]));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary.clone(),
        config(3),
    )
    .with_tool("search_db", Arc::new(SearchDb))
    .unwrap();

    let result = engine.run(sky_inputs()).await.unwrap();

    let output = &result.trajectory.steps()[0].output;
    assert!(output.starts_with("row about sky\n"));
    assert!(output.contains("search_db failed: empty search term"));
    assert_eq!(result.outputs.get_str("answer"), Some("row about sky"));

    let requests = primary.requests();
    let system = &requests[0][0].content;
    assert!(system.contains("search_db(term) -> matching rows"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures and fallbacks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_primary_failure_is_fatal() {
    let primary = Arc::new(ScriptedModel::new([js("print(1)")]).then_fail("connection refused"));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(5),
    );

    let err = engine.run(sky_inputs()).await.unwrap_err();

    assert_eq!(err.status(), SessionState::Fatal);
    assert_eq!(err.trajectory().map(|t| t.len()), Some(1));
    match err {
        RunError::Fatal { cause, .. } => assert!(matches!(cause, FatalCause::PrimaryModel(_))),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_input_is_config_error() {
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        Arc::new(ScriptedModel::new(Vec::<String>::new())),
        EngineConfig::default(),
    );

    let err = engine
        .run(Inputs::new().with("document", "text"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Config(ConfigError::MissingInput(ref name)) if name == "query"
    ));
    assert!(err.trajectory().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_reasoning_fallback() {
    let primary = Arc::new(ScriptedModel::new([
        reasoned("The sky is probably blue.", "print(document)"),
        "Nothing more to check.".to_string(),
    ]));
    let mut config = config(2);
    config.fallback = FallbackPolicy::LastReasoning;
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config,
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.fallback, Some(FallbackKind::LastReasoning));
    assert_eq!(result.outputs.get_str("answer"), Some("Nothing more to check."));
    assert_eq!(result.trajectory.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_reasoning_fallback_needs_single_field() {
    let primary = Arc::new(ScriptedModel::new([reasoned("Blue.", "print(1)")]));
    let mut config = config(1);
    config.fallback = FallbackPolicy::LastReasoning;
    let engine = Engine::new(
        Signature::parse("document, query -> answer, sources").unwrap(),
        primary,
        config,
    );

    let err = engine.run(sky_inputs()).await.unwrap_err();
    assert_eq!(err.status(), SessionState::BudgetExhausted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extract_fallback() {
    let primary = Arc::new(ScriptedModel::new([
        reasoned("Reading.", "print(document)"),
        "```json\n{\"answer\": \"blue\", \"sources\": [\"document\"]}\n```".to_string(),
    ]));
    let mut config = config(1);
    config.fallback = FallbackPolicy::Extract;
    let engine = Engine::new(
        Signature::parse("document, query -> answer, sources").unwrap(),
        primary.clone(),
        config,
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    assert_eq!(result.fallback, Some(FallbackKind::Extract));
    assert_eq!(result.outputs.get_str("answer"), Some("blue"));
    assert_eq!(result.outputs.get("sources"), Some(&json!(["document"])));
    // The extraction call is not an iteration
    assert_eq!(result.iterations, 1);
    let extraction = primary.requests().pop().unwrap();
    assert!(extraction[1].content.contains("The sky is blue."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sub_model_failure_is_fatal() {
    let primary = Arc::new(ScriptedModel::new([js(
        "try { llm_query('hello'); } catch (e) { print('caught'); }\nprint('after')",
    )]));
    let sub = Arc::new(ScriptedModel::new(Vec::<String>::new()).then_fail("sub-model offline"));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary,
        config(5),
    )
    .with_sub_model(sub);

    let err = engine.run(sky_inputs()).await.unwrap_err();

    assert_eq!(err.status(), SessionState::Fatal);
    let trajectory = err.trajectory().unwrap();
    assert_eq!(trajectory.len(), 1);
    assert!(trajectory.steps()[0].code.contains("llm_query('hello')"));
    match err {
        RunError::Fatal {
            cause: FatalCause::Sandbox(SandboxError::SubModel(message)),
            ..
        } => assert!(message.contains("sub-model offline")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresponsive_sandbox_is_fatal() {
    let primary = Arc::new(ScriptedModel::new([
        js("var end = Date.now() + 1000;\nwhile (Date.now() < end) {}"),
        js("SUBMIT('never reached')"),
    ]));
    let mut config = config(5);
    config.timeouts.sandbox_execution = Duration::from_millis(100);
    config.timeouts.sandbox_grace = Duration::from_millis(200);
    config.limits.loop_iteration_limit = u64::MAX;
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        primary.clone(),
        config,
    );

    let err = engine.run(sky_inputs()).await.unwrap_err();

    assert_eq!(err.status(), SessionState::Fatal);
    assert_eq!(err.trajectory().map(|t| t.len()), Some(1));
    assert_eq!(primary.requests().len(), 1);
    match err {
        RunError::Fatal {
            cause: FatalCause::Sandbox(SandboxError::Unresponsive(limit)),
            ..
        } => assert_eq!(limit, Duration::from_millis(300)),
        other => panic!("unexpected error: {}", other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live model
// ─────────────────────────────────────────────────────────────────────────────

/// Full session against a local Ollama server
#[tokio::test(flavor = "multi_thread")]
#[ignore = "Requires Ollama running on localhost:11434"]
async fn test_live_ollama_session() {
    let model = Arc::new(rlm_engine::OllamaModel::new("http://localhost:11434", "qwen3"));
    let engine = Engine::new(
        Signature::parse("document, query -> answer").unwrap(),
        model,
        config(8),
    );

    let result = engine.run(sky_inputs()).await.unwrap();

    let answer = result.outputs.get_str("answer").unwrap_or_default().to_lowercase();
    assert!(answer.contains("blue"));
}
