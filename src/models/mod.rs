//! Core data models for the research assistant.
//!
//! This module contains the data structures shared across the application:
//! stored paper sections and their provenance, transient retrieval and web
//! results, the evidence bundle handed to synthesis, and conversation turns.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Represents a single author with their affiliation information.
///
/// Authors are stored as part of paper metadata and include both the author's name
/// and their institutional affiliation at the time of publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    /// Full name of the author
    pub name: String,

    /// Institutional affiliation (e.g., university, research lab)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl Author {
    /// Create an author without affiliation.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: None,
        }
    }

    /// Split a comma separated author line (as shown on search result cards).
    pub fn parse_list(raw: &str) -> Vec<Author> {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Author::named)
            .collect()
    }
}

/// Optional descriptive metadata attached to a paper and to each of its sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperMetadata {
    /// Authors in publication order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<Author>,

    /// arXiv identifier (e.g. `2106.01234`), when the paper comes from arXiv
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arxiv_id: Option<String>,

    /// Year of publication (used for filtering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_year: Option<i32>,
}

/// Unique identity of a stored section: the paper it belongs to plus its name.
///
/// Two sections with the same key are the same section; storing one again
/// replaces the earlier copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionKey {
    pub paper_id: String,
    pub section_name: String,
}

impl SectionKey {
    pub fn new(paper_id: impl Into<String>, section_name: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            section_name: section_name.into(),
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.paper_id, self.section_name)
    }
}

/// A candidate paper returned by discovery, before any section is extracted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperRef {
    /// Stable paper identifier (arXiv id when available)
    pub paper_id: String,

    /// Paper title
    pub title: String,

    /// Landing page or full-text link
    pub url: String,

    /// Abstract text, when discovery provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,

    #[serde(default)]
    pub metadata: PaperMetadata,
}

/// A section of a paper together with its embedding.
///
/// This is the unit of storage and retrieval in the knowledge base. The
/// embedding length always equals the dimension declared by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaperSection {
    /// Identity within the store
    pub key: SectionKey,

    /// Title of the source paper
    pub paper_title: String,

    /// URL of the source paper
    pub paper_url: String,

    /// Raw section text
    pub text: String,

    /// Embedding of the section text; not serialized into user-facing output
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,

    #[serde(default)]
    pub metadata: PaperMetadata,
}

/// Relevance classification for retrieved passages.
///
/// Passages are categorized by their similarity to the query, allowing
/// clients to understand the quality of matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelevanceLevel {
    /// Extremely high similarity (score > 0.95)
    Identical,

    /// Very high similarity (score > 0.85)
    HighlySimilar,

    /// Moderate similarity (score > 0.70)
    Similar,

    /// Lower similarity but still returned
    Relevant,
}

impl RelevanceLevel {
    /// Determine relevance level from a similarity score.
    ///
    /// # Arguments
    /// * `score` - Similarity score, higher is better
    pub fn from_score(score: f32) -> Self {
        if score > 0.95 {
            RelevanceLevel::Identical
        } else if score > 0.85 {
            RelevanceLevel::HighlySimilar
        } else if score > 0.70 {
            RelevanceLevel::Similar
        } else {
            RelevanceLevel::Relevant
        }
    }
}

/// A stored section returned for a query, with its score and rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub section: PaperSection,

    /// Similarity score (higher = more relevant)
    pub score: f32,

    /// 1-based position in the result list
    pub rank: usize,

    pub relevance: RelevanceLevel,
}

impl RetrievedPassage {
    pub fn new(section: PaperSection, score: f32, rank: usize) -> Self {
        Self {
            section,
            score,
            rank,
            relevance: RelevanceLevel::from_score(score),
        }
    }
}

/// A single web search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebResult {
    /// Query string that produced this result
    pub query: String,
    pub title: String,
    pub snippet: String,
    pub url: String,
    /// 1-based position within the results of `query`
    pub rank: usize,
}

/// All evidence gathered for one analysis run.
///
/// Passages and web results keep the order in which they were gathered; the
/// citation markers `[P1]..` and `[W1]..` used during synthesis refer to
/// positions in these lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    /// The user question this evidence was gathered for
    pub question: String,
    pub passages: Vec<RetrievedPassage>,
    pub web_results: Vec<WebResult>,
}

impl EvidenceBundle {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty() && self.web_results.is_empty()
    }

    /// Look up the passage cited as `[P<index>]` (1-based).
    pub fn passage(&self, index: usize) -> Option<&RetrievedPassage> {
        index.checked_sub(1).and_then(|i| self.passages.get(i))
    }

    /// Look up the web result cited as `[W<index>]` (1-based).
    pub fn web_result(&self, index: usize) -> Option<&WebResult> {
        index.checked_sub(1).and_then(|i| self.web_results.get(i))
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Dispatch mode of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plain conversation with the language model
    #[default]
    Chat,
    /// Build the knowledge base for a topic
    Search,
    /// Answer a question from local and web evidence
    Analysis,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Search => "search",
            Mode::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "plain" => Ok(Mode::Chat),
            "search" => Ok(Mode::Search),
            "analysis" => Ok(Mode::Analysis),
            other => Err(format!("unknown mode '{other}' (expected chat, search or analysis)")),
        }
    }
}

/// One entry of the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub mode: Mode,
    pub content: String,

    /// Evidence behind an analysis answer, shared with the outcome that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Arc<EvidenceBundle>>,
}

impl ConversationTurn {
    pub fn user(mode: Mode, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            mode,
            content: content.into(),
            evidence: None,
        }
    }

    pub fn assistant(mode: Mode, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            mode,
            content: content.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Arc<EvidenceBundle>) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

/// Similarity metric declared by a store.
///
/// A store scores every query with the metric it was created with; mixing
/// metrics between ingestion and retrieval is not allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    /// Euclidean distance mapped to `1 / (1 + d)` so higher stays better
    L2,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::L2 => "l2",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "l2" | "euclidean" => Ok(SimilarityMetric::L2),
            other => Err(format!("unknown similarity metric '{other}'")),
        }
    }
}

/// Configuration for the embedding space of a store.
///
/// This configuration is stored alongside the sections to ensure consistency
/// between ingestion and query-time embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingConfig {
    /// Name/identifier of the embedding model (e.g., "embeddinggemma:latest")
    pub model_name: String,

    /// Dimension of the embedding vectors
    pub dimension: usize,

    /// Metric every query against the store is scored with
    #[serde(default)]
    pub metric: SimilarityMetric,
}
