//! Ingestion pipeline module.
//!
//! This module builds the knowledge base for a research topic: it asks the
//! discovery collaborator for papers, extracts their sections, drops sections
//! that are too short or are boilerplate, embeds what is left and upserts it
//! into the section store.
//!
//! # Usage Patterns
//!
//! ## Primary: Adding Papers to Existing Storage
//! The typical workflow is to connect to an existing database that already
//! carries an embedding configuration:
//!
//! ```ignore
//! let storage = Arc::new(SqliteStorage::open("arxiv_data/knowledge.db")?);
//! let library = Arc::new(JsonPaperLibrary::open("arxiv_data/papers").await?);
//! let pipeline = IngestionPipeline::connect(
//!     embedding,
//!     storage,
//!     PaperSources::from_shared(library),
//!     IngestionConfig::default(),
//! )
//! .await?;
//! let stats = pipeline.ingest("graph neural networks").await?;
//! println!("Stored {} sections", stats.sections_stored);
//! ```
//!
//! The pipeline automatically:
//! - Validates that the embedding provider matches the stored configuration
//! - Skips papers discovery returned more than once
//! - Replaces sections that were ingested before (upsert by paper id and
//!   section name), so running the same topic twice stores nothing new
//!
//! ## Secondary: Creating New Storage
//! `IngestionPipeline::initialize_new` creates the schema and records the
//! embedding configuration before the first ingestion. Sections embedded
//! under a different configuration are deleted, so every stored vector
//! always has the recorded dimension.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DATA_DIR;
use crate::embedding::{normalize_text, EmbeddingProvider};
use crate::models::{EmbeddingConfig, PaperRef, PaperSection, SectionKey, SimilarityMetric};
use crate::provider::{ExtractedSection, PaperDiscovery, ProviderError, SectionExtractor};
use crate::storage::{SectionStore, StorageError, UpsertOutcome};

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    /// Paper discovery failed
    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),

    /// Invalid input data or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Ingestion settings, the `[ingestion]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Directory of per-paper JSON files used by the binaries
    pub papers_dir: PathBuf,

    /// Maximum number of papers taken from discovery per topic; 0 means no cap
    pub max_papers: usize,

    /// Number of sections embedded per request
    pub batch_size: usize,

    /// Sections with fewer characters are skipped
    pub min_section_chars: usize,

    /// Section titles (compared case-insensitively) that are never stored
    pub excluded_titles: Vec<String>,

    /// Substrings marking text the extractor failed to parse
    pub error_markers: Vec<String>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            papers_dir: PathBuf::from(DEFAULT_DATA_DIR).join("papers"),
            max_papers: 10,
            batch_size: 16,
            min_section_chars: 300,
            excluded_titles: ["references", "citations", "quick links", "arxivlabs", "access paper"]
                .into_iter()
                .map(String::from)
                .collect(),
            error_markers: vec!["fatal error".to_string(), "abruptly".to_string()],
        }
    }
}

impl IngestionConfig {
    /// Why `section` should not be stored, or `None` if it is usable.
    pub fn rejection_reason(&self, section: &ExtractedSection) -> Option<&'static str> {
        let title = section.name.trim().to_lowercase();
        if self.excluded_titles.iter().any(|t| t.eq_ignore_ascii_case(&title)) {
            return Some("excluded title");
        }
        let content = section.text.to_lowercase();
        if self.error_markers.iter().any(|m| content.contains(&m.to_lowercase())) {
            return Some("extraction error marker");
        }
        if section.text.chars().count() < self.min_section_chars {
            return Some("too short");
        }
        None
    }
}

/// Statistics from an ingestion run.
///
/// This struct tracks the outcomes of processing one topic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionStats {
    pub topic: String,

    /// Discovery queries issued for the topic, in order
    pub queries: Vec<String>,

    /// Distinct papers returned by discovery (after the cap)
    pub papers_found: usize,

    /// Papers discovery returned more than once
    pub duplicate_papers: usize,

    /// Papers with at least one section stored
    pub papers_ingested: usize,

    /// Papers that failed extraction or had no usable section
    pub papers_skipped: usize,

    /// Sections embedded and stored (new plus replaced)
    pub sections_stored: usize,

    /// Stored sections that replaced an earlier copy
    pub sections_updated: usize,

    /// Sections rejected by the quality filter
    pub sections_filtered: usize,

    /// Sections that could not be embedded or stored
    pub sections_failed: usize,

    /// One line per recovered failure
    pub warnings: Vec<String>,
}

impl IngestionStats {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            ..Self::default()
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Sections stored for the first time.
    pub fn sections_inserted(&self) -> usize {
        self.sections_stored - self.sections_updated
    }
}

/// The discovery and extraction collaborators.
#[derive(Clone)]
pub struct PaperSources {
    pub discovery: Arc<dyn PaperDiscovery>,
    pub extractor: Arc<dyn SectionExtractor>,
}

impl PaperSources {
    pub fn new(discovery: Arc<dyn PaperDiscovery>, extractor: Arc<dyn SectionExtractor>) -> Self {
        Self { discovery, extractor }
    }

    /// Use one value for both roles.
    pub fn from_shared<T>(source: Arc<T>) -> Self
    where
        T: PaperDiscovery + SectionExtractor + 'static,
    {
        Self {
            discovery: source.clone(),
            extractor: source,
        }
    }
}

/// A section waiting for its embedding.
struct PendingSection {
    section: PaperSection,
    embed_text: String,
}

/// Ingestion pipeline coordinator.
///
/// # Primary Use Case: Connect to Existing Storage
/// ```ignore
/// let pipeline = IngestionPipeline::connect(embedding, storage, sources, config).await?;
/// pipeline.ingest("graph neural networks").await?;
/// ```
///
/// # Secondary Use Case: Initialize New Storage
/// ```ignore
/// let pipeline = IngestionPipeline::initialize_new(embedding, storage, sources, config, metric).await?;
/// ```
pub struct IngestionPipeline {
    embedding: Arc<dyn EmbeddingProvider>,
    storage: Arc<dyn SectionStore>,
    sources: PaperSources,
    config: IngestionConfig,
}

impl IngestionPipeline {
    /// Connect to an existing storage and prepare for ingestion.
    ///
    /// **This is the primary method for normal operation.**
    ///
    /// # Errors
    /// Returns `IngestionError::InvalidInput` if:
    /// - The storage has no embedding configuration
    /// - The provider's model or dimension doesn't match the stored configuration
    pub async fn connect(
        embedding: Arc<dyn EmbeddingProvider>,
        storage: Arc<dyn SectionStore>,
        sources: PaperSources,
        config: IngestionConfig,
    ) -> IngestionResult<Self> {
        validate_batch_size(&config)?;
        storage.initialize().await?;

        let stored = storage.get_config().await?.ok_or_else(|| {
            IngestionError::InvalidInput(
                "Storage has no embedding configuration. Use initialize_new() for new storage."
                    .to_string(),
            )
        })?;
        check_compatible(embedding.as_ref(), &stored)?;

        Ok(Self {
            embedding,
            storage,
            sources,
            config,
        })
    }

    /// Initialize new storage with the given embedding provider.
    ///
    /// **Use this only when setting up a new database.** It creates the
    /// schema and stores the provider's model, dimension and `metric`.
    /// When the store already holds sections embedded under another
    /// configuration, they are deleted first.
    pub async fn initialize_new(
        embedding: Arc<dyn EmbeddingProvider>,
        storage: Arc<dyn SectionStore>,
        sources: PaperSources,
        config: IngestionConfig,
        metric: SimilarityMetric,
    ) -> IngestionResult<Self> {
        validate_batch_size(&config)?;
        storage.initialize().await?;

        let new_config = EmbeddingConfig {
            model_name: embedding.model_name().to_string(),
            dimension: embedding.dimension(),
            metric,
        };
        if let Some(previous) = storage.get_config().await? {
            let stale = storage.count_sections().await?;
            if previous != new_config && stale > 0 {
                warn!(
                    sections = stale,
                    previous_model = %previous.model_name,
                    previous_dimension = previous.dimension,
                    "embedding configuration changed, clearing the knowledge base"
                );
                storage.reset().await?;
            }
        }
        storage.store_config(&new_config).await?;

        Ok(Self {
            embedding,
            storage,
            sources,
            config,
        })
    }

    /// Connect when the store is configured, initialize it otherwise.
    pub async fn open(
        embedding: Arc<dyn EmbeddingProvider>,
        storage: Arc<dyn SectionStore>,
        sources: PaperSources,
        config: IngestionConfig,
        metric: SimilarityMetric,
    ) -> IngestionResult<Self> {
        storage.initialize().await?;
        if storage.get_config().await?.is_some() {
            Self::connect(embedding, storage, sources, config).await
        } else {
            Self::initialize_new(embedding, storage, sources, config, metric).await
        }
    }

    pub fn storage(&self) -> &Arc<dyn SectionStore> {
        &self.storage
    }

    /// Build the knowledge base for `topic`.
    ///
    /// Single papers or sections that fail are skipped and reported in
    /// `IngestionStats::warnings`; the run itself only fails when discovery
    /// fails or the topic is blank.
    pub async fn ingest(&self, topic: &str) -> IngestionResult<IngestionStats> {
        self.ingest_queries(topic, &[topic.trim().to_string()]).await
    }

    /// Build the knowledge base for `topic` from several discovery queries.
    ///
    /// Papers found by more than one query are ingested once. A failing
    /// query is skipped with a warning; the run fails only when every query
    /// fails. Blank queries are ignored, and `topic` itself is searched when
    /// none are left.
    pub async fn ingest_queries(&self, topic: &str, queries: &[String]) -> IngestionResult<IngestionStats> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(IngestionError::InvalidInput("topic must not be empty".to_string()));
        }

        let mut stats = IngestionStats::new(topic);
        stats.queries = queries
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(String::from)
            .collect();
        if stats.queries.is_empty() {
            stats.queries.push(topic.to_string());
        }
        info!(topic, queries = ?stats.queries, discovery = self.sources.discovery.name(), "starting ingestion");

        let papers = self.discover(&mut stats).await?;
        for paper in &papers {
            self.ingest_paper(paper, &mut stats).await;
        }

        info!(
            topic,
            papers = stats.papers_ingested,
            skipped = stats.papers_skipped,
            sections = stats.sections_stored,
            "ingestion finished"
        );
        Ok(stats)
    }

    /// Remove every stored section, keeping the embedding configuration.
    pub async fn reset(&self) -> IngestionResult<()> {
        self.storage.reset().await?;
        info!("knowledge base cleared");
        Ok(())
    }

    async fn discover(&self, stats: &mut IngestionStats) -> IngestionResult<Vec<PaperRef>> {
        let mut seen = HashSet::new();
        let mut papers = Vec::new();
        let mut first_error = None;
        let mut failed = 0;

        for query in stats.queries.clone() {
            let found = match self.sources.discovery.find_papers(&query).await {
                Ok(found) => found,
                Err(e) => {
                    failed += 1;
                    stats.warn(format!("Discovery for \"{query}\" failed: {e}"));
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            for paper in found {
                if !seen.insert(paper.paper_id.clone()) {
                    stats.duplicate_papers += 1;
                    continue;
                }
                papers.push(paper);
            }
        }

        if failed == stats.queries.len() {
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }
        if self.config.max_papers > 0 {
            papers.truncate(self.config.max_papers);
        }

        stats.papers_found = papers.len();
        debug!(
            topic = %stats.topic,
            papers = papers.len(),
            duplicates = stats.duplicate_papers,
            "discovery finished"
        );
        Ok(papers)
    }

    async fn ingest_paper(&self, paper: &PaperRef, stats: &mut IngestionStats) {
        let extracted = match self.sources.extractor.extract_sections(paper).await {
            Ok(sections) => sections,
            Err(e) => {
                stats.papers_skipped += 1;
                stats.warn(format!("Skipped paper {}: extraction failed: {e}", paper.paper_id));
                return;
            }
        };

        let mut pending = Vec::new();
        let mut names = HashSet::new();
        for section in extracted {
            if let Some(reason) = self.config.rejection_reason(&section) {
                debug!(paper_id = %paper.paper_id, section = %section.name, reason, "section filtered");
                stats.sections_filtered += 1;
                continue;
            }
            // the first section wins when a paper repeats a heading
            if !names.insert(section.name.clone()) {
                stats.sections_filtered += 1;
                continue;
            }
            pending.push(pending_section(paper, section));
        }

        if pending.is_empty() {
            stats.papers_skipped += 1;
            stats.warn(format!("Skipped paper {}: no usable sections", paper.paper_id));
            return;
        }

        let mut stored = 0;
        for chunk in pending.chunks(self.config.batch_size) {
            stored += self.store_chunk(chunk, stats).await;
        }

        if stored > 0 {
            stats.papers_ingested += 1;
        } else {
            stats.papers_skipped += 1;
        }
    }

    /// Embed and upsert one batch; returns the number of sections stored.
    async fn store_chunk(&self, chunk: &[PendingSection], stats: &mut IngestionStats) -> usize {
        let texts: Vec<&str> = chunk.iter().map(|p| p.embed_text.as_str()).collect();

        let embeddings: Vec<Option<Vec<f32>>> = match self.embedding.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == chunk.len() => vectors.into_iter().map(Some).collect(),
            Ok(vectors) => {
                stats.warn(format!(
                    "Embedding batch returned {} vectors for {} sections; retrying one by one",
                    vectors.len(),
                    chunk.len()
                ));
                self.embed_individually(chunk, stats).await
            }
            Err(e) if e.is_unavailable() => {
                stats.sections_failed += chunk.len();
                stats.warn(format!("Skipped {} sections: {e}", chunk.len()));
                return 0;
            }
            Err(e) => {
                debug!(error = %e, "batch embedding failed, retrying one by one");
                self.embed_individually(chunk, stats).await
            }
        };

        let mut stored = 0;
        for (pending, embedding) in chunk.iter().zip(embeddings) {
            let Some(embedding) = embedding else {
                continue;
            };
            let mut section = pending.section.clone();
            section.embedding = embedding;

            match self.storage.upsert_section(&section).await {
                Ok(outcome) => {
                    stored += 1;
                    stats.sections_stored += 1;
                    if outcome == UpsertOutcome::Updated {
                        stats.sections_updated += 1;
                    }
                }
                Err(e) => {
                    stats.sections_failed += 1;
                    stats.warn(format!("Failed to store section {}: {e}", section.key));
                }
            }
        }
        stored
    }

    async fn embed_individually(
        &self,
        chunk: &[PendingSection],
        stats: &mut IngestionStats,
    ) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(chunk.len());
        for pending in chunk {
            match self.embedding.embed(&pending.embed_text).await {
                Ok(vector) => out.push(Some(vector)),
                Err(e) => {
                    stats.sections_failed += 1;
                    stats.warn(format!("Skipped section {}: {e}", pending.section.key));
                    out.push(None);
                }
            }
        }
        out
    }
}

fn validate_batch_size(config: &IngestionConfig) -> IngestionResult<()> {
    if config.batch_size == 0 {
        return Err(IngestionError::InvalidInput(
            "batch_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn check_compatible(embedding: &dyn EmbeddingProvider, stored: &EmbeddingConfig) -> IngestionResult<()> {
    if embedding.model_name() != stored.model_name {
        return Err(IngestionError::InvalidInput(format!(
            "Embedding model mismatch: provider uses '{}' but storage has '{}'",
            embedding.model_name(),
            stored.model_name
        )));
    }
    if embedding.dimension() != stored.dimension {
        return Err(IngestionError::InvalidInput(format!(
            "Embedding dimension mismatch: provider has {} but storage has {}",
            embedding.dimension(),
            stored.dimension
        )));
    }
    Ok(())
}

/// The text that gets embedded for a section, carrying its provenance.
pub fn embedding_text(paper: &PaperRef, section_name: &str, content: &str) -> String {
    normalize_text(&format!(
        "Source: {} (Link: {})\nSection: {}\n\n{}",
        paper.paper_id, paper.url, section_name, content
    ))
}

fn pending_section(paper: &PaperRef, section: ExtractedSection) -> PendingSection {
    let embed_text = embedding_text(paper, &section.name, &section.text);
    PendingSection {
        section: PaperSection {
            key: SectionKey::new(paper.paper_id.clone(), section.name),
            paper_title: paper.title.clone(),
            paper_url: paper.url.clone(),
            text: section.text,
            embedding: Vec::new(),
            metadata: paper.metadata.clone(),
        },
        embed_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaperMetadata;
    use crate::provider::ProviderResult;
    use crate::storage::memory::InMemoryStore;
    use crate::testing::{MockEmbedding, MOCK_DIMENSION};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // ===== Mock Implementations =====

    /// Discovery and extraction over a fixed set of papers.
    #[derive(Default)]
    struct MockLibrary {
        papers: Vec<PaperRef>,
        sections: HashMap<String, Vec<ExtractedSection>>,
        failing_papers: Vec<String>,
        discovery_fails: bool,
        failing_queries: Vec<String>,
        queries: Mutex<Vec<String>>,
        extract_calls: Mutex<Vec<String>>,
    }

    impl MockLibrary {
        fn with_paper(mut self, id: &str, sections: Vec<ExtractedSection>) -> Self {
            self.papers.push(paper(id));
            self.sections.insert(id.to_string(), sections);
            self
        }

        fn failing_extraction(mut self, id: &str) -> Self {
            self.papers.push(paper(id));
            self.failing_papers.push(id.to_string());
            self
        }

        fn duplicate(mut self, id: &str) -> Self {
            self.papers.push(paper(id));
            self
        }
    }

    #[async_trait]
    impl PaperDiscovery for MockLibrary {
        async fn find_papers(&self, topic: &str) -> ProviderResult<Vec<PaperRef>> {
            self.queries.lock().unwrap().push(topic.to_string());
            if self.discovery_fails || self.failing_queries.iter().any(|q| q == topic) {
                return Err(ProviderError::NetworkError("search page timed out".to_string()));
            }
            Ok(self.papers.clone())
        }

        fn name(&self) -> &str {
            "mock-library"
        }
    }

    #[async_trait]
    impl SectionExtractor for MockLibrary {
        async fn extract_sections(&self, paper: &PaperRef) -> ProviderResult<Vec<ExtractedSection>> {
            self.extract_calls.lock().unwrap().push(paper.paper_id.clone());
            if self.failing_papers.contains(&paper.paper_id) {
                return Err(ProviderError::ParseError("no ar5iv rendering".to_string()));
            }
            Ok(self.sections.get(&paper.paper_id).cloned().unwrap_or_default())
        }
    }

    // ===== Test Helper Functions =====

    fn paper(id: &str) -> PaperRef {
        PaperRef {
            paper_id: id.to_string(),
            title: format!("Paper {id}"),
            url: format!("https://arxiv.org/abs/{id}"),
            abstract_text: None,
            metadata: PaperMetadata::default(),
        }
    }

    fn long(text: &str) -> String {
        format!("{text} {}", "filler ".repeat(60))
    }

    fn good(name: &str, text: &str) -> ExtractedSection {
        ExtractedSection::new(name, long(text))
    }

    async fn pipeline_with(
        library: MockLibrary,
        embedding: MockEmbedding,
        config: IngestionConfig,
    ) -> (IngestionPipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = IngestionPipeline::initialize_new(
            Arc::new(embedding),
            store.clone(),
            PaperSources::from_shared(Arc::new(library)),
            config,
            SimilarityMetric::Cosine,
        )
        .await
        .unwrap();
        (pipeline, store)
    }

    async fn pipeline(library: MockLibrary) -> (IngestionPipeline, Arc<InMemoryStore>) {
        pipeline_with(library, MockEmbedding::new(), IngestionConfig::default()).await
    }

    // ===== Configuration Validation Tests =====

    #[tokio::test]
    async fn test_connect_with_matching_config() {
        let store = Arc::new(InMemoryStore::with_config(MockEmbedding::config()));
        let result = IngestionPipeline::connect(
            Arc::new(MockEmbedding::new()),
            store,
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_with_model_mismatch() {
        let mut config = MockEmbedding::config();
        config.model_name = "embeddinggemma:latest".to_string();
        let store = Arc::new(InMemoryStore::with_config(config));
        let err = IngestionPipeline::connect(
            Arc::new(MockEmbedding::new()),
            store,
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("model mismatch"));
    }

    #[tokio::test]
    async fn test_connect_with_dimension_mismatch() {
        let mut config = MockEmbedding::config();
        config.dimension = MOCK_DIMENSION + 1;
        let store = Arc::new(InMemoryStore::with_config(config));
        let err = IngestionPipeline::connect(
            Arc::new(MockEmbedding::new()),
            store,
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn test_connect_with_missing_config() {
        let result = IngestionPipeline::connect(
            Arc::new(MockEmbedding::new()),
            Arc::new(InMemoryStore::new()),
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(IngestionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_initialize_new_stores_config_with_metric() {
        let store = Arc::new(InMemoryStore::new());
        IngestionPipeline::initialize_new(
            Arc::new(MockEmbedding::new()),
            store.clone(),
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
            SimilarityMetric::L2,
        )
        .await
        .unwrap();
        let stored = store.get_config().await.unwrap().unwrap();
        assert_eq!(stored.model_name, "mock-keywords");
        assert_eq!(stored.metric, SimilarityMetric::L2);
    }

    #[tokio::test]
    async fn test_initialize_new_clears_sections_of_another_model() {
        let old = EmbeddingConfig {
            model_name: "tiny-model".to_string(),
            dimension: 2,
            metric: SimilarityMetric::Cosine,
        };
        let store = Arc::new(InMemoryStore::with_config(old));
        let mut stale = crate::testing::embedded_section("old", "Intro", "graph");
        stale.embedding = vec![1.0, 0.0];
        store.upsert_section(&stale).await.unwrap();

        IngestionPipeline::initialize_new(
            Arc::new(MockEmbedding::new()),
            store.clone(),
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
            SimilarityMetric::Cosine,
        )
        .await
        .unwrap();

        assert_eq!(store.get_config().await.unwrap().unwrap().dimension, MOCK_DIMENSION);
        assert_eq!(store.count_sections().await.unwrap(), 0);
        let hits = store.query(&MockEmbedding::vector("graph"), 5, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_new_with_same_config_keeps_sections() {
        let store = Arc::new(InMemoryStore::with_config(MockEmbedding::config()));
        store
            .upsert_section(&crate::testing::embedded_section("p1", "Intro", "graph"))
            .await
            .unwrap();

        IngestionPipeline::initialize_new(
            Arc::new(MockEmbedding::new()),
            store.clone(),
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            IngestionConfig::default(),
            SimilarityMetric::Cosine,
        )
        .await
        .unwrap();
        assert_eq!(store.count_sections().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let config = IngestionConfig {
            batch_size: 0,
            ..IngestionConfig::default()
        };
        let result = IngestionPipeline::initialize_new(
            Arc::new(MockEmbedding::new()),
            Arc::new(InMemoryStore::new()),
            PaperSources::from_shared(Arc::new(MockLibrary::default())),
            config,
            SimilarityMetric::Cosine,
        )
        .await;
        assert!(matches!(result, Err(IngestionError::InvalidInput(_))));
    }

    // ===== Ingestion Tests =====

    #[tokio::test]
    async fn test_ingest_stores_sections() {
        let library = MockLibrary::default()
            .with_paper("p1", vec![good("Introduction", "graph"), good("Method", "dynamic graph")])
            .with_paper("p2", vec![good("Results", "temporal")]);
        let (pipeline, store) = pipeline(library).await;

        let stats = pipeline.ingest("graph neural networks").await.unwrap();
        assert_eq!(stats.papers_found, 2);
        assert_eq!(stats.papers_ingested, 2);
        assert_eq!(stats.sections_stored, 3);
        assert_eq!(stats.sections_inserted(), 3);
        assert!(stats.warnings.is_empty());
        assert_eq!(store.count_sections().await.unwrap(), 3);
        assert_eq!(store.paper_ids().await.unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let library = MockLibrary::default()
            .with_paper("p1", vec![good("Introduction", "graph"), good("Method", "dynamic")]);
        let (pipeline, store) = pipeline(library).await;

        let first = pipeline.ingest("graphs").await.unwrap();
        let second = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(first.sections_stored, 2);
        assert_eq!(second.sections_stored, 2);
        assert_eq!(second.sections_updated, 2);
        assert_eq!(store.count_sections().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blank_topic_rejected() {
        let (pipeline, _) = pipeline(MockLibrary::default()).await;
        assert!(matches!(pipeline.ingest("   ").await, Err(IngestionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_provider_error() {
        let library = MockLibrary {
            discovery_fails: true,
            ..MockLibrary::default()
        };
        let (pipeline, _) = pipeline(library).await;
        assert!(matches!(pipeline.ingest("graphs").await, Err(IngestionError::ProviderError(_))));
    }

    #[tokio::test]
    async fn test_duplicate_papers_processed_once() {
        let library = MockLibrary::default()
            .with_paper("p1", vec![good("Introduction", "graph")])
            .duplicate("p1");
        let (pipeline, _) = pipeline(library).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.duplicate_papers, 1);
        assert_eq!(stats.papers_found, 1);
        assert_eq!(stats.sections_stored, 1);
    }

    #[tokio::test]
    async fn test_ingest_queries_dedupes_papers_across_queries() {
        let library = Arc::new(
            MockLibrary::default()
                .with_paper("p1", vec![good("Introduction", "graph")])
                .with_paper("p2", vec![good("Introduction", "temporal")]),
        );
        let store = Arc::new(InMemoryStore::new());
        let pipeline = IngestionPipeline::initialize_new(
            Arc::new(MockEmbedding::new()),
            store.clone(),
            PaperSources::from_shared(library.clone()),
            IngestionConfig::default(),
            SimilarityMetric::Cosine,
        )
        .await
        .unwrap();

        let queries = vec!["dynamic gnn".to_string(), "  ".to_string(), "temporal graphs".to_string()];
        let stats = pipeline.ingest_queries("graph neural networks", &queries).await.unwrap();
        assert_eq!(stats.queries, vec!["dynamic gnn", "temporal graphs"]);
        assert_eq!(*library.queries.lock().unwrap(), vec!["dynamic gnn", "temporal graphs"]);
        assert_eq!(stats.papers_found, 2);
        assert_eq!(stats.duplicate_papers, 2);
        assert_eq!(library.extract_calls.lock().unwrap().len(), 2);
        assert_eq!(store.count_sections().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failing_discovery_query_is_skipped() {
        let library = MockLibrary {
            failing_queries: vec!["bad query".to_string()],
            ..MockLibrary::default()
        }
        .with_paper("p1", vec![good("Introduction", "graph")]);
        let (pipeline, _) = pipeline(library).await;

        let queries = vec!["bad query".to_string(), "good query".to_string()];
        let stats = pipeline.ingest_queries("graphs", &queries).await.unwrap();
        assert_eq!(stats.sections_stored, 1);
        assert!(stats.warnings[0].contains("bad query"));

        let err = pipeline.ingest_queries("graphs", &queries[..1]).await.unwrap_err();
        assert!(matches!(err, IngestionError::ProviderError(_)));
    }

    #[tokio::test]
    async fn test_max_papers_caps_discovery() {
        let library = MockLibrary::default()
            .with_paper("p1", vec![good("A", "graph")])
            .with_paper("p2", vec![good("A", "graph")])
            .with_paper("p3", vec![good("A", "graph")]);
        let config = IngestionConfig {
            max_papers: 2,
            ..IngestionConfig::default()
        };
        let (pipeline, store) = pipeline_with(library, MockEmbedding::new(), config).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.papers_found, 2);
        assert_eq!(store.paper_ids().await.unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_quality_filter() {
        let library = MockLibrary::default()
            .with_paper(
                "p1",
                vec![
                    good("Introduction", "graph"),
                    good("References", "[1] Kipf and Welling"),
                    ExtractedSection::new("Method", "too short"),
                    good("Appendix", "LaTeX Fatal Error: file not found"),
                ],
            )
            .with_paper("p2", vec![good("Quick Links", "nav"), ExtractedSection::new("Body", "short")]);
        let (pipeline, store) = pipeline(library).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.sections_stored, 1);
        assert_eq!(stats.sections_filtered, 5);
        assert_eq!(stats.papers_ingested, 1);
        assert_eq!(stats.papers_skipped, 1);
        assert_eq!(stats.warnings.len(), 1);
        assert!(stats.warnings[0].contains("p2"));
        assert_eq!(store.count_sections().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_extraction_failure_skips_paper() {
        let library = MockLibrary::default()
            .failing_extraction("broken")
            .with_paper("p1", vec![good("Introduction", "graph")]);
        let (pipeline, _) = pipeline(library).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.papers_skipped, 1);
        assert_eq!(stats.papers_ingested, 1);
        assert!(stats.warnings[0].contains("broken"));
    }

    #[tokio::test]
    async fn test_batch_failure_falls_back_to_single_embeds() {
        let library = MockLibrary::default()
            .with_paper("p1", vec![good("Introduction", "graph"), good("Method", "poison graph")]);
        let embedding = MockEmbedding::new().with_failing_batches().fail_on_text("poison");
        let (pipeline, store) = pipeline_with(library, embedding.clone(), IngestionConfig::default()).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.sections_stored, 1);
        assert_eq!(stats.sections_failed, 1);
        assert_eq!(embedding.batch_calls().len(), 1);
        assert_eq!(embedding.embed_calls().len(), 2);
        assert_eq!(store.count_sections().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_embedding_skips_without_abort() {
        let library = MockLibrary::default().with_paper("p1", vec![good("Introduction", "graph")]);
        let (pipeline, store) = pipeline_with(library, MockEmbedding::unavailable(), IngestionConfig::default()).await;

        let stats = pipeline.ingest("graphs").await.unwrap();
        assert_eq!(stats.sections_stored, 0);
        assert_eq!(stats.sections_failed, 1);
        assert_eq!(stats.papers_skipped, 1);
        assert_eq!(store.count_sections().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let sections = (0..5).map(|i| good(&format!("S{i}"), "graph")).collect();
        let library = MockLibrary::default().with_paper("p1", sections);
        let embedding = MockEmbedding::new();
        let config = IngestionConfig {
            batch_size: 2,
            ..IngestionConfig::default()
        };
        let (pipeline, _) = pipeline_with(library, embedding.clone(), config).await;

        pipeline.ingest("graphs").await.unwrap();
        let sizes: Vec<usize> = embedding.batch_calls().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_embedding_text_carries_provenance() {
        let text = embedding_text(&paper("2006.10637"), "Introduction", "Graphs  Change");
        assert_eq!(
            text,
            "source: 2006.10637 (link: https://arxiv.org/abs/2006.10637) section: introduction graphs change"
        );
    }

    #[tokio::test]
    async fn test_reset_clears_sections() {
        let library = MockLibrary::default().with_paper("p1", vec![good("Introduction", "graph")]);
        let (pipeline, store) = pipeline(library).await;
        pipeline.ingest("graphs").await.unwrap();

        pipeline.reset().await.unwrap();
        assert_eq!(store.count_sections().await.unwrap(), 0);
        assert!(store.get_config().await.unwrap().is_some());
    }
}
