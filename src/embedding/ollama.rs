//! Ollama embedding provider implementation.
//!
//! Talks to the `/api/embed` endpoint of a local Ollama service, which accepts
//! a batch of inputs and returns one vector per input in order.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_dimension, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::config::EmbeddingSettings;

/// Embedding client for an Ollama service.
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: Client,

    /// Full URL of the embed endpoint
    endpoint: String,

    /// Model identifier (e.g., "embeddinggemma:latest")
    model: String,

    /// Expected dimension of the embedding vectors
    embedding_dimension: usize,
}

impl OllamaEmbedding {
    /// Create a new Ollama embedding provider.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if the HTTP client cannot be built
    pub fn new(settings: &EmbeddingSettings) -> EmbeddingResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/api/embed", settings.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            model: settings.model.clone(),
            embedding_dimension: settings.dimension,
        })
    }

    async fn request(&self, inputs: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let body = EmbedRequest {
            model: &self.model,
            input: inputs,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::ApiError(format!(
                "Ollama embed request failed ({status}): {text}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ApiError(format!("failed to parse embed response: {e}")))?;

        if parsed.embeddings.len() != inputs.len() {
            return Err(EmbeddingError::ApiError(format!(
                "Ollama returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                inputs.len()
            )));
        }
        ensure_dimension(&parsed.embeddings, self.embedding_dimension)?;

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }

        self.request(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        debug!(model = %self.model, count = texts.len(), "embedding batch");
        self.request(texts).await
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn map_transport_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        EmbeddingError::Unavailable(err.to_string())
    } else {
        EmbeddingError::ApiError(err.to_string())
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}
