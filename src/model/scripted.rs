//! Offline models for tests and dry runs

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{last_user_content, ChatMessage, LanguageModel, ModelError};

/// Replays a fixed list of replies in order and records every request
pub struct ScriptedModel {
    name: String,
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "scripted".to_string(),
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failing reply after the current ones
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Err(message.into()));
        self
    }

    /// Every conversation this model was asked to complete, in call order
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    /// Number of replies not yet consumed
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        lock(&self.requests).push(messages.to_vec());
        match lock(&self.replies).pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(ModelError::Other(message)),
            None => Err(ModelError::ScriptExhausted),
        }
    }
}

type ReplyFn = dyn Fn(&str) -> String + Send + Sync;
type DelayFn = dyn Fn(&str) -> Duration + Send + Sync;

/// Answers each prompt with a closure over the last user message
pub struct FnModel {
    name: String,
    reply: Box<ReplyFn>,
    delay: Option<Box<DelayFn>>,
}

impl FnModel {
    pub fn new(reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            name: "fn".to_string(),
            reply: Box::new(reply),
            delay: None,
        }
    }

    /// Sleep for a prompt-dependent duration before answering
    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }
}

#[async_trait]
impl LanguageModel for FnModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let prompt = last_user_content(messages);
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(prompt)).await;
        }
        Ok((self.reply)(prompt))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
