//! Upstream LLM provider.
//!
//! - [`openai`]: Client for OpenAI-compatible chat-completion APIs (Groq by default)
//! - [`sse`]: Incremental decoder for the provider's `data:` event stream
//!
//! Handlers only see the [`ChatBackend`] trait, so tests can substitute a
//! scripted backend for the network client.

pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A role-tagged message of the upstream conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
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
}

/// Fully resolved parameters of one upstream completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Content of the first choice, empty when the provider sent none.
    pub content: String,

    /// Total token usage, zero when the provider did not report it.
    pub total_tokens: u64,
}

/// Lazy, forward-only sequence of newly generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// Provider answered 429.
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// Provider rejected our credentials (401).
    #[error("upstream rejected the API key (status {status})")]
    Unauthorized { status: u16 },

    /// Any other provider-reported failure.
    #[error("upstream error (status {status:?}): {message}")]
    Provider { status: Option<u16>, message: String },

    /// The call or the stream exceeded its time bound.
    #[error("upstream request timed out")]
    Timeout,

    /// The provider's payload could not be understood.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Classify a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => LlmError::RateLimited,
            401 => LlmError::Unauthorized { status },
            _ => LlmError::Provider {
                status: Some(status),
                message: provider_message(body),
            },
        }
    }
}

/// Pull `error.message` out of an OpenAI-style error body, else return the body.
fn provider_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => "Upstream request failed".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

/// A chat-completion provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Run a completion and return the whole answer.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Start a streaming completion.
    ///
    /// Resolves once the provider has accepted the request, so status-level
    /// failures surface here rather than inside the stream.
    async fn complete_stream(&self, request: &CompletionRequest)
        -> Result<FragmentStream, LlmError>;
}
