//! Web search client abstraction.

pub mod duckduckgo;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::WebResult;

#[derive(Debug, Error)]
pub enum WebSearchError {
    /// The search engine could not be reached, timed out, or refused the request
    #[error("Web search unavailable: {0}")]
    Unavailable(String),

    /// The result page could not be understood
    #[error("Failed to parse search results: {0}")]
    Parse(String),

    #[error("Invalid search query: {0}")]
    InvalidQuery(String),
}

pub type WebSearchResult<T> = Result<T, WebSearchError>;

/// Keyword search against an external engine.
#[async_trait]
pub trait WebSearchClient: Send + Sync {
    /// Return at most `max_results` hits for `query`, best first.
    ///
    /// Every returned `WebResult` carries `query` and its 1-based rank.
    async fn search(&self, query: &str, max_results: usize) -> WebSearchResult<Vec<WebResult>>;

    fn name(&self) -> &str;
}
