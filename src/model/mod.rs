//! Language model abstraction
//!
//! Both the primary model (driving the loop) and the secondary model (behind
//! `llm_query`) are reached through [`LanguageModel`]. Retrying is the
//! implementation's job; the engine treats a returned error as final.

pub mod ollama;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaModel;
pub use scripted::{FnModel, ScriptedModel};

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A chat-completion capable model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier used in logs and metrics
    fn name(&self) -> &str;

    /// Complete the conversation, returning the assistant's text
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}

/// Error type for model calls
#[derive(Debug)]
pub enum ModelError {
    /// Transport-level failure (after retries)
    Request(reqwest::Error),
    /// Non-success HTTP status (after retries)
    Status { code: u16, body: String },
    /// Response body was not the expected JSON
    Parse(serde_json::Error),
    /// Model returned no content
    EmptyResponse,
    /// A scripted model ran out of replies
    ScriptExhausted,
    /// Model-specific failure
    Other(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Request(e) => write!(f, "Request error: {}", e),
            ModelError::Status { code, body } => write!(f, "HTTP {}: {}", code, body),
            ModelError::Parse(e) => write!(f, "Parse error: {}", e),
            ModelError::EmptyResponse => write!(f, "Empty response from model"),
            ModelError::ScriptExhausted => write!(f, "Scripted model has no replies left"),
            ModelError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Request(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Parse(e)
    }
}

/// Text of the last user message, used as the prompt by simple models
pub(crate) fn last_user_content(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("")
}
