//! Storage layer abstraction and implementations.
//!
//! This module defines the interface for persisting paper sections with their
//! embeddings and answering nearest-neighbour queries over them. Two backends
//! are provided: SQLite for the persistent knowledge base and an in-memory
//! store for ephemeral sessions and tests.
//!
//! Every store declares one [`SimilarityMetric`] in its [`EmbeddingConfig`];
//! all queries against the store are scored with that metric.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EmbeddingConfig, PaperSection, SimilarityMetric};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution failed: {0}")]
    QueryError(String),

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Schema or migration error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// No embedding configuration has been stored yet
    #[error("Store has no embedding configuration; initialize it first")]
    MissingConfig,

    /// A vector does not match the dimension declared by the store
    #[error("Embedding dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Other unexpected errors
    #[error("Unexpected storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Year range filter for queries.
///
/// Allows filtering sections by the publication year of their paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    /// Start year (inclusive)
    pub start: i32,

    /// End year (inclusive)
    pub end: i32,
}

impl YearRange {
    /// Create a new year range.
    ///
    /// # Arguments
    /// * `start` - Start year (inclusive)
    /// * `end` - End year (inclusive)
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    /// Check if a year falls within this range.
    pub fn contains(&self, year: i32) -> bool {
        year >= self.start && year <= self.end
    }
}

/// Metadata filter applied while searching.
///
/// All populated criteria must hold for a section to match. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionFilter {
    /// Restrict to these papers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paper_ids: Vec<String>,

    /// Case-insensitive substring of any author name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Sections whose paper has no known year never match a year filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years: Option<YearRange>,
}

impl SectionFilter {
    pub fn for_papers<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paper_ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_years(mut self, years: YearRange) -> Self {
        self.years = Some(years);
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.paper_ids.is_empty() && self.author.is_none() && self.years.is_none()
    }

    pub fn matches(&self, section: &PaperSection) -> bool {
        if !self.paper_ids.is_empty() && !self.paper_ids.iter().any(|id| *id == section.key.paper_id) {
            return false;
        }
        if let Some(needle) = &self.author {
            let needle = needle.to_lowercase();
            let found = section
                .metadata
                .authors
                .iter()
                .any(|a| a.name.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        if let Some(range) = self.years {
            match section.metadata.published_year {
                Some(year) if range.contains(year) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Whether an upsert created a new section or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// A stored section with its score for one query.
#[derive(Debug, Clone)]
pub struct ScoredSection {
    pub section: PaperSection,

    /// Similarity under the store's metric (higher = closer)
    pub score: f32,

    /// Insertion sequence of the section; replacing a section keeps it
    pub sequence: i64,
}

/// Trait for section storage backends.
///
/// Methods take `&self`; implementations synchronize internally so queries
/// can run while an ingestion is writing. Each upsert is atomic per key.
#[async_trait]
pub trait SectionStore: Send + Sync {
    /// Initialize the storage (create tables, indexes, etc.).
    ///
    /// This is idempotent and safe to call multiple times.
    async fn initialize(&self) -> StorageResult<()>;

    /// Store the embedding configuration.
    ///
    /// The configuration fixes the dimension and metric of the store and is
    /// read back at query time so retrieval embeds with the same model.
    async fn store_config(&self, config: &EmbeddingConfig) -> StorageResult<()>;

    /// Retrieve the embedding configuration, or `None` if never stored.
    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>>;

    /// Insert a section, or replace the stored section with the same key.
    ///
    /// # Errors
    /// Returns `StorageError::DimensionMismatch` if the embedding length
    /// differs from the configured dimension, and `StorageError::MissingConfig`
    /// if no configuration was stored
    async fn upsert_section(&self, section: &PaperSection) -> StorageResult<UpsertOutcome>;

    /// Return at most `k` sections closest to `vector`.
    ///
    /// Results are ordered by descending score; equal scores keep insertion
    /// order. Sections rejected by `filter` are never returned.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SectionFilter>,
    ) -> StorageResult<Vec<ScoredSection>>;

    async fn count_sections(&self) -> StorageResult<usize>;

    /// Distinct paper ids with at least one stored section, sorted.
    async fn paper_ids(&self) -> StorageResult<Vec<String>>;

    /// Remove every section. The embedding configuration is kept.
    async fn reset(&self) -> StorageResult<()>;
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 when the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Euclidean distance mapped into `(0, 1]`, so that higher is closer.
pub fn l2_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let distance: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt();
    1.0 / (1.0 + distance)
}

pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine_similarity(a, b),
        SimilarityMetric::L2 => l2_similarity(a, b),
    }
}

/// Check a vector against the dimension declared by the store.
pub(crate) fn check_dimension(config: &EmbeddingConfig, vector: &[f32]) -> StorageResult<()> {
    if vector.len() != config.dimension {
        return Err(StorageError::DimensionMismatch {
            expected: config.dimension,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Order candidates best first, drop repeated keys and unscorable ones, keep the top `k`.
pub(crate) fn rank_candidates(mut candidates: Vec<ScoredSection>, k: usize) -> Vec<ScoredSection> {
    candidates.retain(|c| !c.score.is_nan());
    candidates.sort_by(|a, b| {
        b.score.total_cmp(&a.score).then(a.sequence.cmp(&b.sequence))
    });

    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.section.key.clone()));
    candidates.truncate(k);
    candidates
}
