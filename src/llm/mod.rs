//! Language model client abstraction.
//!
//! The orchestrator and the chat mode talk to the model only through
//! [`LlmClient`]. Model output that is consumed as data (query lists) goes
//! through [`complete_structured`], which treats the text as untrusted and
//! reports anything that does not parse as `LlmError::MalformedOutput`.

pub mod ollama;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to the language model.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The model service could not be reached or did not answer in time
    #[error("Language model unavailable: {0}")]
    Unavailable(String),

    /// The model answered but the requested structure could not be parsed
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    /// The service answered with an error status
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for language model operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Shape the caller expects the answer in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Ask the backend to constrain output to a JSON object
    Json,
}

/// A single completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub format: ResponseFormat,
}

impl CompletionRequest {
    /// System prompt plus one user message, the common shape for agent calls.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            format: ResponseFormat::Text,
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }
}

/// Trait for language model backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run the request and return the raw text of the model's reply.
    ///
    /// # Errors
    /// Returns `LlmError::Unavailable` on connection failure or timeout
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String>;

    fn model_name(&self) -> &str;
}

/// Run `request` in JSON mode and deserialize the reply into `T`.
///
/// # Errors
/// Returns `LlmError::MalformedOutput` when the reply holds no JSON value of
/// the expected shape; transport errors pass through unchanged
pub async fn complete_structured<T>(client: &dyn LlmClient, request: &CompletionRequest) -> LlmResult<T>
where
    T: DeserializeOwned,
{
    let request = request.clone().with_format(ResponseFormat::Json);
    let raw = client.complete(&request).await?;
    parse_structured(&raw)
}

/// Parse a model reply as `T`, tolerating code fences and surrounding prose.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> LlmResult<T> {
    let candidate = extract_json(raw)
        .ok_or_else(|| LlmError::MalformedOutput(format!("no JSON value in reply: {}", preview(raw))))?;
    serde_json::from_str(candidate)
        .map_err(|e| LlmError::MalformedOutput(format!("{e}; reply: {}", preview(raw))))
}

/// Find the outermost JSON object or array inside `raw`.
fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    let start = unfenced.find(['{', '['])?;
    let close = if unfenced[start..].starts_with('{') { '}' } else { ']' };
    let end = unfenced.rfind(close)?;
    (end > start).then(|| &unfenced[start..=end])
}

fn preview(raw: &str) -> String {
    const MAX: usize = 120;
    let mut out: String = raw.chars().take(MAX).collect();
    if raw.chars().count() > MAX {
        out.push('…');
    }
    out
}
