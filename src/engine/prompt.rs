//! Prompt construction and response parsing for the primary model

use crate::config::Budgets;
use crate::model::ChatMessage;
use crate::signature::Signature;
use crate::tools::{ToolEntry, ToolRegistry};
use crate::trajectory::{Step, Trajectory};

use super::variables::VariableInfo;

/// Generic guidance; the task-specific section is appended after it
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You answer questions about data that is too large to read directly.
The data lives in variables inside a persistent JavaScript environment. You explore it by writing code.

Each turn, reply with a short explanation of what you will do next, followed by exactly one code block:

```javascript
// your code
```

Rules:
- Only output produced with print(...) (or console.log) is shown to you. Print what you need to see.
- Variables declared with `var` and functions persist between turns.
- Inspect the data in slices before processing all of it; print lengths and small samples first.
- Use llm_query(prompt) to ask a helper model about a chunk of text, and llm_query_batched([...]) to ask
  about many chunks at once. Each prompt costs one call from a limited budget.
- When you have the final answer, call SUBMIT(...) in a code block. Nothing after SUBMIT runs.
- There is no filesystem or network access; only the functions listed below are available."#;

/// The full system message: generic guidance plus the task contract
pub fn system_prompt(
    base: Option<&str>,
    signature: &Signature,
    tools: &ToolRegistry,
    budgets: &Budgets,
) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();

    if let Some(instructions) = signature.instructions() {
        prompt.push_str("\n\nTask instructions:\n");
        prompt.push_str(instructions);
    }

    prompt.push_str("\n\nAvailable functions:\n");
    for (name, entry) in tools.iter() {
        let description = match entry {
            ToolEntry::BuiltIn(builtin) => builtin.description().to_string(),
            ToolEntry::User(tool) if tool.description().is_empty() => format!("{}(...)", name),
            ToolEntry::User(tool) => format!("{}(...): {}", name, tool.description()),
        };
        prompt.push_str(&format!("- {}\n", description));
    }

    prompt.push_str("\nOutput fields to submit:\n");
    for field in signature.outputs() {
        prompt.push_str(&format!("- {}\n", field));
    }
    prompt.push_str(&format!("Submit with: {}\n", signature.submit_hint()));

    prompt.push_str(&format!(
        "\nBudget: at most {} turns and {} helper-model calls. Output longer than {} characters is cut off.",
        budgets.max_iterations, budgets.max_llm_calls, budgets.max_output_chars
    ));
    prompt
}

/// First user message: metadata about every input, never the full values
pub fn opening_message(signature: &Signature, variables: &[VariableInfo]) -> String {
    let mut message = String::from("The following variables are loaded in the environment:\n\n");
    for variable in variables {
        message.push_str(&variable.render());
        message.push('\n');
    }
    let outputs: Vec<&str> = signature.output_names().collect();
    message.push_str(&format!(
        "\nProduce: {}. Start by exploring the variables.",
        outputs.join(", ")
    ));
    message
}

/// User message reporting what the previous step produced
pub fn observation_message(step: &Step, remaining_iterations: usize) -> String {
    let body = if step.code.is_empty() {
        "No code was run. Reply with a code block to make progress.".to_string()
    } else if step.output.is_empty() {
        "(no output; use print() to see values)".to_string()
    } else {
        step.output.clone()
    };
    format!(
        "Output of step {}:\n{}\n\n[{} turn(s) remaining]",
        step.index + 1,
        body,
        remaining_iterations
    )
}

/// A primary model reply split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Text before the first code fence
    pub reasoning: String,
    /// Contents of every fenced block, in order; empty if there were none
    pub code: String,
}

/// Split a reply into reasoning and code
///
/// An unterminated fence runs to the end of the reply.
pub fn parse_response(text: &str) -> ParsedResponse {
    let Some(first) = text.find("```") else {
        return ParsedResponse {
            reasoning: text.trim().to_string(),
            code: String::new(),
        };
    };

    let reasoning = text[..first].trim().to_string();
    let mut blocks = Vec::new();
    let mut rest = &text[first..];

    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the language tag line
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(body[..close].trim_end().to_string());
                rest = &body[close + 3..];
            }
            None => {
                blocks.push(body.trim_end().to_string());
                break;
            }
        }
    }

    let code = blocks
        .into_iter()
        .filter(|b| !b.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    ParsedResponse { reasoning, code }
}

/// Messages for the one-shot extraction used when the iteration budget runs out
pub fn extract_messages(signature: &Signature, trajectory: &Trajectory) -> Vec<ChatMessage> {
    let mut transcript = String::new();
    for step in trajectory {
        transcript.push_str(&format!("## Step {}\n", step.index + 1));
        if !step.reasoning.is_empty() {
            transcript.push_str(&format!("Reasoning:\n{}\n", step.reasoning));
        }
        if !step.code.is_empty() {
            transcript.push_str(&format!("Code:\n{}\n", step.code));
        }
        if !step.output.is_empty() {
            transcript.push_str(&format!("Output:\n{}\n", step.output));
        }
        transcript.push('\n');
    }

    let fields: Vec<&str> = signature.output_names().collect();
    vec![
        ChatMessage::system(
            "You extract final answers from an unfinished investigation. \
             Reply with a single JSON object and nothing else.",
        ),
        ChatMessage::user(format!(
            "{}Based only on the steps above, produce a JSON object with exactly these keys: {}.",
            transcript,
            fields.join(", ")
        )),
    ]
}

/// First JSON object embedded in a reply
pub fn parse_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&text[start..=end])
        .ok()
        .filter(|v| v.is_object())
}
