//! FastEmbed embedding provider implementation.
//!
//! Runs the embedding model in-process through the fastembed library, so no
//! inference service needs to be running. Model files are downloaded to the
//! cache directory on first use.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use super::{ensure_dimension, EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::config::EmbeddingSettings;

/// In-process embedding provider.
#[derive(Clone)]
pub struct FastEmbedProvider {
    /// The embedding model instance (wrapped in Arc<Mutex> for thread-safety)
    model: Arc<Mutex<TextEmbedding>>,

    model_name: String,

    embedding_dimension: usize,
}

impl FastEmbedProvider {
    /// Create a provider for `model`, caching model files under `cache_dir`.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if model initialization fails
    pub fn new(model: EmbeddingModel, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        let model_name = format!("{:?}", model);
        let embedding_dimension = dimension_of(&model);

        let mut init_options = InitOptions::new(model);
        if let Some(dir) = cache_dir {
            init_options = init_options.with_cache_dir(dir);
        }

        let text_embedding = TextEmbedding::try_new(init_options).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to initialize FastEmbed model: {}", e))
        })?;

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            model_name,
            embedding_dimension,
        })
    }

    /// Build from configuration; the configured dimension must match the model.
    pub fn from_settings(settings: &EmbeddingSettings) -> EmbeddingResult<Self> {
        let model = parse_model(&settings.model)?;
        let expected = dimension_of(&model);
        if expected != settings.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: settings.dimension,
                actual: expected,
            });
        }

        let cache_dir = settings
            .cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|p| p.join("fastembed")));

        Self::new(model, cache_dir)
    }

    async fn run(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Vec<f32>>> {
        let mut model = self.model.lock().await;
        let embeddings = model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::Other(format!("Embedding generation failed: {}", e)))?;
        ensure_dimension(&embeddings, self.embedding_dimension)?;
        Ok(embeddings)
    }
}

fn parse_model(name: &str) -> EmbeddingResult<EmbeddingModel> {
    match name.trim().to_ascii_lowercase().as_str() {
        "allminilml6v2" | "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            Ok(EmbeddingModel::AllMiniLML6V2)
        }
        "bgesmallenv15" | "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => {
            Ok(EmbeddingModel::BGESmallENV15)
        }
        "bgebaseenv15" | "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => {
            Ok(EmbeddingModel::BGEBaseENV15)
        }
        "nomicembedtextv15" | "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => Err(EmbeddingError::ConfigError(format!(
            "unsupported fastembed model '{other}'"
        ))),
    }
}

fn dimension_of(model: &EmbeddingModel) -> usize {
    match model {
        EmbeddingModel::AllMiniLML6V2 | EmbeddingModel::BGESmallENV15 => 384,
        EmbeddingModel::BGEBaseENV15 | EmbeddingModel::NomicEmbedTextV15 => 768,
        EmbeddingModel::BGELargeENV15 => 1024,
        _ => 384,
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }

        self.run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        self.run(texts.iter().map(|s| s.to_string()).collect()).await
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// TextEmbedding does not implement Debug.
impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.model_name)
            .field("embedding_dimension", &self.embedding_dimension)
            .finish()
    }
}
