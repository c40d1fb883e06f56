//! Paper provider module.
//!
//! This module defines the two collaborators the ingestion pipeline depends
//! on: [`PaperDiscovery`] finds candidate papers for a topic and
//! [`SectionExtractor`] turns one paper into named sections of text.
//!
//! The traits abstract the source of paper data so the pipeline works the
//! same against a local JSON library, a scraper, or a test double.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::PaperRef;

pub mod json;

/// Errors that can occur when fetching papers from a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Failed to read from the data source
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the data format
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Network or connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The provider knows nothing about the requested paper
    #[error("Paper not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Other provider-specific errors
    #[error("Provider error: {0}")]
    Other(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A named block of text extracted from a paper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSection {
    pub name: String,
    pub text: String,
}

impl ExtractedSection {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Finds candidate papers for a research topic.
///
/// # Design Notes
///
/// - Results need not be deduplicated; the ingestion pipeline drops repeated
///   paper ids
/// - Providers handle their own pagination and rate limiting
#[async_trait]
pub trait PaperDiscovery: Send + Sync {
    /// Find papers relevant to `topic`, most relevant first.
    ///
    /// # Errors
    /// Returns `ProviderError` if the source cannot be searched at all
    async fn find_papers(&self, topic: &str) -> ProviderResult<Vec<PaperRef>>;

    /// Get a human-readable name of this provider, for logging.
    fn name(&self) -> &str;
}

/// Splits a paper into sections.
#[async_trait]
pub trait SectionExtractor: Send + Sync {
    /// Return the paper's sections in document order.
    ///
    /// # Errors
    /// Returns `ProviderError` if the paper cannot be fetched or parsed
    async fn extract_sections(&self, paper: &PaperRef) -> ProviderResult<Vec<ExtractedSection>>;
}
