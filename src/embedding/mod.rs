//! Embedding provider abstraction and implementations.
//!
//! This module defines the interface for text embedding generation and provides
//! implementations for the supported backends: a local Ollama inference
//! service over HTTP and, behind the `local-embed` feature, an in-process
//! fastembed model.
//!
//! The abstraction allows the system to swap between embedding models without
//! changing the core logic of ingestion or retrieval.

#[cfg(feature = "local-embed")]
pub mod fastembed;
pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{EmbeddingBackend, EmbeddingSettings};

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The inference service could not be reached or did not answer in time
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The service answered with an error status or an unusable body
    #[error("API request failed: {0}")]
    ApiError(String),

    /// Invalid input text (e.g., empty)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., unknown model)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The provider produced vectors of an unexpected length
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl EmbeddingError {
    /// Whether the failure means the provider itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Trait for text embedding providers.
///
/// Implementors of this trait can generate vector embeddings from text inputs.
/// The trait is async to support service-based embedding backends.
///
/// # Example Usage
/// ```ignore
/// let provider = OllamaEmbedding::new(settings)?;
/// let text = normalize_text("Graph neural networks on dynamic graphs");
/// let embedding = provider.embed(&text).await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Arguments
    /// * `text` - The input text to embed (should be pre-normalized)
    ///
    /// # Errors
    /// Returns `EmbeddingError::Unavailable` when the backend cannot be reached
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Generate embeddings for multiple texts in a single batch.
    ///
    /// # Returns
    /// A vector of embedding vectors, in the same order as the input texts
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Get the dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    /// Get the model name/identifier for this provider.
    fn model_name(&self) -> &str;
}

/// Build the provider selected in the configuration.
///
/// # Errors
/// Returns `EmbeddingError::ConfigError` if the backend is not compiled in or
/// cannot be initialized
pub fn from_settings(settings: &EmbeddingSettings) -> EmbeddingResult<Arc<dyn EmbeddingProvider>> {
    match settings.backend {
        EmbeddingBackend::Ollama => Ok(Arc::new(ollama::OllamaEmbedding::new(settings)?)),
        #[cfg(feature = "local-embed")]
        EmbeddingBackend::FastEmbed => Ok(Arc::new(fastembed::FastEmbedProvider::from_settings(
            settings,
        )?)),
        #[cfg(not(feature = "local-embed"))]
        EmbeddingBackend::FastEmbed => Err(EmbeddingError::ConfigError(
            "the fastembed backend requires building with the `local-embed` feature".to_string(),
        )),
    }
}

/// Check that every vector has the expected length.
pub(crate) fn ensure_dimension(vectors: &[Vec<f32>], expected: usize) -> EmbeddingResult<()> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(bad) => Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

/// Normalizes text for consistent embedding generation.
///
/// This function applies the following transformations:
/// - Converts to lowercase
/// - Trims leading/trailing whitespace
/// - Collapses runs of whitespace (including newlines) to a single space
///
/// # Example
/// ```
/// use research_team::embedding::normalize_text;
/// assert_eq!(normalize_text("  Hello   World  "), "hello world");
/// ```
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
