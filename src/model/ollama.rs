//! Ollama `/api/chat` backed model

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ChatMessage, LanguageModel, ModelError};

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    eval_duration: u64,
}

/// Client for Ollama's /api/chat endpoint bound to one model
#[derive(Clone)]
pub struct OllamaModel {
    base_url: String,
    model: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl OllamaModel {
    /// Create a new model client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Set how many times a failed request is retried and the delay between attempts
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn send_once(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ModelError::Status {
                code: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        debug!(
            model = %self.model,
            eval_count = chat_response.eval_count,
            eval_duration_ns = chat_response.eval_duration,
            "Ollama chat completed"
        );
        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let mut attempt = 0;
        loop {
            match self.send_once(messages).await {
                Ok(content) => return Ok(content),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    warn!(
                        model = %self.model,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Model request failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transport failures, rate limiting and server errors are worth another attempt
fn is_retryable(error: &ModelError) -> bool {
    match error {
        ModelError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        ModelError::Status { code, .. } => *code == 429 || *code >= 500,
        _ => false,
    }
}
