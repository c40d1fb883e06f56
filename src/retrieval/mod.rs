//! Query processing and ranking module.
//!
//! The retrieval engine embeds a query and asks the section store for its
//! nearest sections. Scoring uses the metric the store declares, so the
//! engine never chooses a metric of its own.
//!
//! # Usage
//!
//! ```ignore
//! let engine = RetrievalEngine::new(embedding, storage);
//! let passages = engine.retrieve("How do GNNs handle dynamic graphs?", 5, None).await?;
//! for passage in passages {
//!     println!("{} - Score: {:.3}", passage.section.key, passage.score);
//! }
//! ```
//!
//! Text normalization is automatically applied to queries before embedding.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::embedding::{normalize_text, EmbeddingError, EmbeddingProvider};
use crate::models::RetrievedPassage;
use crate::storage::{SectionFilter, SectionStore, StorageError};

/// Errors that can occur during retrieval.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The embedding provider could not be reached
    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Embedding generation failed for another reason
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    /// Storage access failed
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    /// Invalid query parameters
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl From<EmbeddingError> for RetrievalError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::Unavailable(msg) => RetrievalError::EmbeddingUnavailable(msg),
            other => RetrievalError::EmbeddingError(other.to_string()),
        }
    }
}

/// Result type for retrieval operations.
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Trait for search and ranking engines.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `k` passages for `query`, best first, ranks starting at 1.
    ///
    /// # Errors
    /// Returns `RetrievalError::InvalidQuery` for a blank query or `k == 0`,
    /// and `RetrievalError::EmbeddingUnavailable` when the query cannot be
    /// embedded
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&SectionFilter>,
    ) -> RetrievalResult<Vec<RetrievedPassage>>;
}

/// Default retrieval engine over a [`SectionStore`].
#[derive(Clone)]
pub struct RetrievalEngine {
    embedding: Arc<dyn EmbeddingProvider>,
    storage: Arc<dyn SectionStore>,
}

impl RetrievalEngine {
    pub fn new(embedding: Arc<dyn EmbeddingProvider>, storage: Arc<dyn SectionStore>) -> Self {
        Self { embedding, storage }
    }

    pub fn storage(&self) -> &Arc<dyn SectionStore> {
        &self.storage
    }
}

#[async_trait]
impl Retriever for RetrievalEngine {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&SectionFilter>,
    ) -> RetrievalResult<Vec<RetrievedPassage>> {
        if k == 0 {
            return Err(RetrievalError::InvalidQuery("k must be at least 1".to_string()));
        }
        let normalized = normalize_text(query);
        if normalized.is_empty() {
            return Err(RetrievalError::InvalidQuery("query is empty".to_string()));
        }

        // an empty store answers without touching the provider
        if self.storage.count_sections().await? == 0 {
            debug!("knowledge base is empty, skipping retrieval");
            return Ok(Vec::new());
        }

        let vector = self.embedding.embed(&normalized).await?;
        let hits = self.storage.query(&vector, k, filter).await?;
        debug!(k, hits = hits.len(), "retrieved passages");

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| RetrievedPassage::new(hit.section, hit.score, i + 1))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelevanceLevel;
    use crate::storage::memory::InMemoryStore;
    use crate::testing::{embedded_section, MockEmbedding};
    use std::collections::HashSet;

    async fn engine_with(sections: &[(&str, &str, &str)], embedding: MockEmbedding) -> RetrievalEngine {
        let store = InMemoryStore::with_config(MockEmbedding::config());
        for (paper, name, text) in sections {
            store.upsert_section(&embedded_section(paper, name, text)).await.unwrap();
        }
        RetrievalEngine::new(Arc::new(embedding), Arc::new(store))
    }

    #[tokio::test]
    async fn test_results_sorted_ranked_and_bounded() {
        let engine = engine_with(
            &[
                ("p1", "Intro", "protein folding"),
                ("p2", "Method", "dynamic graph neural networks over temporal graph snapshots"),
                ("p3", "Intro", "graph neural networks"),
                ("p4", "Intro", "language models with attention"),
            ],
            MockEmbedding::new(),
        )
        .await;

        let passages = engine.retrieve("How do GNNs handle dynamic graphs?", 3, None).await.unwrap();
        assert_eq!(passages.len(), 3);
        assert_eq!(passages[0].section.key.paper_id, "p2");
        for pair in passages.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        let ranks: Vec<_> = passages.iter().map(|p| p.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        let keys: HashSet<_> = passages.iter().map(|p| p.section.key.clone()).collect();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_fewer_matches_than_k() {
        let engine = engine_with(&[("p1", "Intro", "graph")], MockEmbedding::new()).await;
        let passages = engine.retrieve("graph", 10, None).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].relevance, RelevanceLevel::Identical);
    }

    #[tokio::test]
    async fn test_empty_store_skips_embedding() {
        let embedding = MockEmbedding::unavailable();
        let engine = engine_with(&[], embedding.clone()).await;
        assert!(engine.retrieve("graphs", 5, None).await.unwrap().is_empty());
        assert!(embedding.embed_calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_queries() {
        let engine = engine_with(&[("p1", "Intro", "graph")], MockEmbedding::new()).await;
        assert!(matches!(engine.retrieve("graph", 0, None).await, Err(RetrievalError::InvalidQuery(_))));
        assert!(matches!(engine.retrieve(" \n ", 3, None).await, Err(RetrievalError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_unavailable_embedding_is_reported() {
        let engine = engine_with(&[("p1", "Intro", "graph")], MockEmbedding::unavailable()).await;
        assert!(matches!(
            engine.retrieve("graph", 3, None).await,
            Err(RetrievalError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_restricts_papers() {
        let engine = engine_with(
            &[("p1", "Intro", "graph"), ("p2", "Intro", "graph neural")],
            MockEmbedding::new(),
        )
        .await;
        let filter = SectionFilter::for_papers(["p1"]);
        let passages = engine.retrieve("graph neural", 5, Some(&filter)).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].section.key.paper_id, "p1");
    }
}
