//! Ollama chat client.
//!
//! Uses the non-streaming `/api/chat` endpoint. JSON mode is requested with
//! `"format": "json"`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatMessage, CompletionRequest, LlmClient, LlmError, LlmResult, ResponseFormat};
use crate::config::LlmSettings;

#[derive(Debug, Clone)]
pub struct OllamaChat {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OllamaChat {
    pub fn new(settings: &LlmSettings) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| LlmError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            format: match request.format {
                ResponseFormat::Json => Some("json"),
                ResponseFormat::Text => None,
            },
            options: ChatOptions {
                temperature: self.temperature,
            },
        }
    }
}

#[async_trait]
impl LlmClient for OllamaChat {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String> {
        debug!(model = %self.model, messages = request.messages.len(), "chat completion");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    LlmError::Unavailable(e.to_string())
                } else {
                    LlmError::ApiError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LlmError::ApiError(format!("Ollama chat failed ({status}): {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ApiError(format!("failed to parse chat response: {e}")))?;

        Ok(parsed.message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
