//! Runtime configuration.
//!
//! Every section has defaults that reproduce a local setup (Ollama on
//! `localhost:11434`, data under `arxiv_data/`), so a config file is optional.
//! Values from a TOML file replace the defaults field by field; command line
//! flags in the binaries override both.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::ingestion::IngestionConfig;
use crate::models::SimilarityMetric;
pub use crate::orchestrator::OrchestratorConfig;
pub use crate::session::SessionConfig;

/// Default directory holding the knowledge base and extracted papers.
pub const DEFAULT_DATA_DIR: &str = "arxiv_data";

/// Default base URL of the local Ollama service.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}.")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path:?}.")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{message}")]
    Validation { message: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub storage: StorageSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub web_search: WebSearchSettings,
    pub orchestrator: OrchestratorConfig,
    pub ingestion: IngestionConfig,
    pub session: SessionConfig,
}

/// Location and metric of the local vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Metric declared when the store is created
    pub metric: SimilarityMetric,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: Path::new(DEFAULT_DATA_DIR).join("knowledge.db"),
            metric: SimilarityMetric::Cosine,
        }
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Ollama,
    #[serde(alias = "fast-embed")]
    FastEmbed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    /// Fixed output dimension; stores created with this provider record it
    pub dimension: usize,
    pub base_url: String,
    pub timeout_ms: u64,
    /// Model cache directory (fastembed only)
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Ollama,
            model: "embeddinggemma:latest".to_string(),
            dimension: 768,
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            timeout_ms: 30_000,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "phi3:3.8b".to_string(),
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            temperature: 0.2,
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchSettings {
    /// HTML search endpoint
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Region code passed as `kl`, e.g. `us-en`
    pub region: Option<String>,
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string(),
            timeout_ms: 15_000,
            region: None,
        }
    }
}

impl ResearchConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ResearchConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Load `path` when given, otherwise fall back to validated defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be greater than zero."));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(invalid("embedding.model must be non-empty."));
        }
        if self.llm.model.trim().is_empty() {
            return Err(invalid("llm.model must be non-empty."));
        }
        if !self.llm.temperature.is_finite() || !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid("llm.temperature must be between 0 and 2."));
        }
        for (name, value) in [
            ("embedding.timeout_ms", self.embedding.timeout_ms),
            ("llm.timeout_ms", self.llm.timeout_ms),
            ("web_search.timeout_ms", self.web_search.timeout_ms),
            ("orchestrator.embed_timeout_ms", self.orchestrator.embed_timeout_ms),
            ("orchestrator.llm_timeout_ms", self.orchestrator.llm_timeout_ms),
            ("orchestrator.search_timeout_ms", self.orchestrator.search_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{name} must be greater than zero.")));
            }
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.top_k == 0 {
            return Err(invalid("orchestrator.top_k must be greater than zero."));
        }
        if orchestrator.max_web_queries == 0 {
            return Err(invalid("orchestrator.max_web_queries must be greater than zero."));
        }
        if orchestrator.results_per_query == 0 {
            return Err(invalid("orchestrator.results_per_query must be greater than zero."));
        }
        if orchestrator.web_concurrency == 0 {
            return Err(invalid("orchestrator.web_concurrency must be greater than zero."));
        }

        if self.ingestion.batch_size == 0 {
            return Err(invalid("ingestion.batch_size must be greater than zero."));
        }
        if self.session.history_window == 0 {
            return Err(invalid("session.history_window must be greater than zero."));
        }
        if self.session.chat_web_grounding && self.session.chat_web_results == 0 {
            return Err(invalid(
                "session.chat_web_results must be greater than zero when chat_web_grounding is on.",
            ));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
