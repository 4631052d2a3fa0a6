//! # rlm CLI
//!
//! Ask questions about a directory of transcripts with the recursive
//! execution engine.
//!
//! Usage:
//!   rlm --question "What helps with focus?"
//!   rlm --docs-dir data/transcripts             (interactive)
//!   rlm -q "..." --save-trajectory runs/ --print-metrics
//!
//! Models and budgets come from `RLM_MAIN_MODEL`, `RLM_SUB_MODEL`,
//! `RLM_OLLAMA_URL`, `RLM_MAX_ITERATIONS`, `RLM_MAX_LLM_CALLS` and
//! `RLM_MAX_OUTPUT_CHARS`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use rlm_engine::telemetry::{init_tracing, shutdown_tracing, LogFormat};
use rlm_engine::trajectory::RunRecord;
use rlm_engine::{
    metrics, Engine, EngineConfig, FallbackPolicy, Inputs, ModelSettings, OllamaModel, RunError,
    RunResult, Signature, Trajectory, TrajectoryStore,
};

const DEFAULT_SIGNATURE: &str = "transcripts, question -> answer, sources";
const CONVERSATION_SIGNATURE: &str = "transcripts, conversation_history, question -> answer, sources";

#[derive(Parser)]
#[command(name = "rlm")]
#[command(author, version, about = "Question answering over large transcript collections")]
struct Cli {
    /// Question to answer; starts an interactive session when omitted
    #[arg(short, long)]
    question: Option<String>,

    /// Directory of *.txt transcripts
    #[arg(short, long, default_value = "data/transcripts")]
    docs_dir: PathBuf,

    /// Signature for one-shot mode
    #[arg(short, long, default_value = DEFAULT_SIGNATURE)]
    signature: String,

    /// What to return when the iteration budget runs out
    #[arg(long, value_enum, default_value_t = Fallback::Fail)]
    fallback: Fallback,

    /// Save each run's trajectory as JSON into this directory
    #[arg(long)]
    save_trajectory: Option<PathBuf>,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    print_metrics: bool,

    /// Export traces to this OTLP endpoint
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Fallback {
    Fail,
    LastReasoning,
    Extract,
}

impl From<Fallback> for FallbackPolicy {
    fn from(f: Fallback) -> Self {
        match f {
            Fallback::Fail => FallbackPolicy::Fail,
            Fallback::LastReasoning => FallbackPolicy::LastReasoning,
            Fallback::Extract => FallbackPolicy::Extract,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    if let Err(e) = init_tracing("rlm", format, cli.otlp_endpoint.as_deref()) {
        eprintln!("[RLM] Failed to initialize tracing: {}", e);
    }

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[RLM] {}", e);
            1
        }
    };

    if cli.print_metrics {
        println!("\n{}", metrics::render());
    }
    shutdown_tracing();
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
    let transcripts = load_transcripts(&cli.docs_dir)
        .map_err(|e| format!("Cannot read {}: {}", cli.docs_dir.display(), e))?;
    if transcripts.is_empty() {
        return Err(format!("No transcripts found in {}", cli.docs_dir.display()).into());
    }
    println!("[RLM] Loaded {} transcripts", transcripts.len());

    let (settings, budgets) = ModelSettings::from_env();
    let retry_delay = Duration::from_millis(settings.retry_delay_ms);
    let primary = Arc::new(
        OllamaModel::new(&settings.ollama_url, &settings.main_model)
            .with_retry(settings.max_retries, retry_delay),
    );
    let sub = Arc::new(
        OllamaModel::new(&settings.ollama_url, settings.sub_model_or_main())
            .with_retry(settings.max_retries, retry_delay),
    );
    println!(
        "[RLM] Models: {} / {}",
        settings.main_model,
        settings.sub_model_or_main()
    );

    let config = EngineConfig {
        budgets,
        fallback: cli.fallback.into(),
        ..EngineConfig::default()
    };
    let store = match &cli.save_trajectory {
        Some(dir) => Some(TrajectoryStore::new(dir)?),
        None => None,
    };
    let transcripts = Value::Object(transcripts);

    match &cli.question {
        Some(question) => {
            let signature = Signature::parse(&cli.signature)?;
            let engine = Engine::new(signature, primary, config).with_sub_model(sub);
            let inputs = Inputs::new()
                .with("transcripts", transcripts)
                .with("question", question.as_str());
            let outcome = engine.run(inputs).await;
            report(&engine, &outcome, store.as_ref());
            Ok(if outcome.is_ok() { 0 } else { 1 })
        }
        None => {
            let signature = Signature::parse(CONVERSATION_SIGNATURE)?;
            let engine = Engine::new(signature, primary, config).with_sub_model(sub);
            interactive(&engine, transcripts, store.as_ref()).await?;
            Ok(0)
        }
    }
}

/// Question loop; follow-up questions see earlier answers
async fn interactive(
    engine: &Engine,
    transcripts: Value,
    store: Option<&TrajectoryStore>,
) -> std::io::Result<()> {
    let mut history: Vec<(String, String)> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    loop {
        print!("? ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        match question.to_lowercase().as_str() {
            "quit" | "exit" | "q" => break,
            "help" => {
                print_help();
                continue;
            }
            "reset" => {
                history.clear();
                println!("History cleared.");
                continue;
            }
            "history" => {
                if history.is_empty() {
                    println!("No history yet.");
                }
                for (i, (q, a)) in history.iter().enumerate() {
                    println!("Q{}: {}\nA{}: {}", i + 1, q, i + 1, truncate(a, 200));
                }
                continue;
            }
            _ => {}
        }

        let inputs = Inputs::new()
            .with("transcripts", transcripts.clone())
            .with("conversation_history", format_history(&history))
            .with("question", question);
        let outcome = engine.run(inputs).await;
        report(engine, &outcome, store);
        if let Ok(result) = &outcome {
            history.push((question.to_string(), field_text(result, "answer")));
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn print_help() {
    println!("Commands: quit | exit | q, help, reset (clear history), history");
}

/// Print steps and outputs, and save the run if requested
fn report(engine: &Engine, outcome: &Result<RunResult, RunError>, store: Option<&TrajectoryStore>) {
    let record = match outcome {
        Ok(result) => {
            print_steps(&result.trajectory);
            println!("\n══ Answer ══\n{}", field_text(result, "answer"));
            for (name, value) in result.outputs.fields() {
                if name != "answer" {
                    println!("\n══ {} ══\n{}", name, render_value(value));
                }
            }
            if let Some(kind) = result.fallback {
                println!("\n(outputs produced by fallback: {:?})", kind);
            }
            println!(
                "\n[RLM] {} step(s), {} sub-model call(s), session {}",
                result.iterations, result.llm_calls, result.session_id
            );

            let mut record = RunRecord::new(
                result.session_id.clone(),
                engine.signature().to_string(),
                if result.fallback.is_some() { "fallback" } else { "completed" },
                result.trajectory.clone(),
            );
            record.outputs = result.outputs.fields().clone();
            record.closing_reasoning = Some(result.closing_reasoning.clone());
            record.llm_calls = result.llm_calls;
            Some(record)
        }
        Err(e) => {
            if let Some(trajectory) = e.trajectory() {
                print_steps(trajectory);
            }
            eprintln!("\n[RLM] {} ({})", e, e.status());
            match (e.session_id(), e.trajectory()) {
                (Some(id), Some(trajectory)) => Some(RunRecord::new(
                    id,
                    engine.signature().to_string(),
                    e.status().as_str(),
                    trajectory.clone(),
                )),
                _ => None,
            }
        }
    };

    if let (Some(store), Some(record)) = (store, record) {
        match store.save(&record) {
            Ok(path) => println!("[RLM] Trajectory saved to {}", path.display()),
            Err(e) => eprintln!("[RLM] Failed to save trajectory: {}", e),
        }
    }
}

fn print_steps(trajectory: &Trajectory) {
    for step in trajectory {
        println!("\n── Step {} ──", step.index + 1);
        if !step.reasoning.is_empty() {
            println!("Reasoning: {}", truncate(&step.reasoning, 500));
        }
        if !step.code.is_empty() {
            println!("┌─────────────────────────────────────────");
            for line in truncate(&step.code, 800).lines() {
                println!("│ {}", line);
            }
            println!("└─────────────────────────────────────────");
        }
        if !step.output.is_empty() {
            println!("{}", truncate(&step.output, 800));
        }
    }
}

/// Transcripts keyed by episode title
fn load_transcripts(dir: &Path) -> std::io::Result<serde_json::Map<String, Value>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|ext| ext == "txt").unwrap_or(false))
        .collect();
    paths.sort();

    let mut transcripts = serde_json::Map::new();
    for path in paths {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = std::fs::read_to_string(&path)?;
        transcripts.insert(transcript_title(&stem), Value::String(text));
    }
    Ok(transcripts)
}

/// `<id>_<date>_<Episode_Title>.vtt` -> `Episode Title`
fn transcript_title(stem: &str) -> String {
    let parts: Vec<&str> = stem.splitn(3, '_').collect();
    match parts.as_slice() {
        [_, _, title] => title.replace('_', " ").replace(".vtt", ""),
        _ => stem.to_string(),
    }
}

fn format_history(history: &[(String, String)]) -> String {
    if history.is_empty() {
        return "No previous conversation.".to_string();
    }
    let mut lines = vec!["Previous conversation:".to_string()];
    for (i, (q, a)) in history.iter().enumerate() {
        lines.push(format!("\nQ{}: {}", i + 1, q));
        lines.push(format!("A{}: {}", i + 1, a));
    }
    lines.join("\n")
}

fn field_text(result: &RunResult, field: &str) -> String {
    result
        .outputs
        .get(field)
        .map(render_value)
        .unwrap_or_default()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("• {}", render_value(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}
