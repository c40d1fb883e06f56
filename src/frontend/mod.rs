//! Front-end boundary.
//!
//! Request and response payloads exchanged with whatever renders the
//! conversation (the `research` REPL prints them as tables or JSON). Every
//! reply a [`ResearchTeam`](crate::session::ResearchTeam) produces, and every
//! error, converts into one [`TurnResponse`].

use serde::{Deserialize, Serialize};

use crate::ingestion::IngestionStats;
use crate::models::{EvidenceBundle, Mode, RetrievedPassage, WebResult};
use crate::orchestrator::{AnalysisOutcome, Citation};
use crate::session::{SessionError, TurnReply, UserInput};

/// A message sent by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,

    /// Mode for this message. It overrides any command prefix in `message`;
    /// without it the prefix, then the session's mode, decides
    #[serde(default)]
    pub mode: Option<Mode>,
}

impl TurnRequest {
    /// The message resolved for a session currently in `current` mode.
    pub fn to_input(&self, current: Mode) -> UserInput {
        UserInput::resolve(&self.message, self.mode, current)
    }
}

/// One rendered reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnResponse {
    Completion {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sources: Vec<WebSourceDto>,
    },
    Ingestion(IngestionSummaryDto),
    Analysis {
        answer: String,
        citations: Vec<Citation>,
        passages: Vec<PassageDto>,
        web: Vec<WebSourceDto>,
        /// Human-readable notes about missing evidence
        warnings: Vec<String>,
    },
    Error {
        message: String,
        cancelled: bool,
    },
}

/// Data transfer object for a retrieved passage.
///
/// The embedding and the full section text are left out; `excerpt` holds
/// the beginning of the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageDto {
    /// Citation marker, e.g. `P1`
    pub marker: String,
    pub paper_id: String,
    pub paper_title: String,
    pub section: String,
    pub url: String,

    /// Relevance level as a string (e.g., "IDENTICAL", "HIGHLY_SIMILAR")
    pub relevance: String,

    pub score: f32,
    pub excerpt: String,
}

const EXCERPT_CHARS: usize = 200;

impl PassageDto {
    fn from_passage(index: usize, passage: &RetrievedPassage) -> Self {
        let section = &passage.section;
        Self {
            marker: format!("P{index}"),
            paper_id: section.key.paper_id.clone(),
            paper_title: section.paper_title.clone(),
            section: section.key.section_name.clone(),
            url: section.paper_url.clone(),
            relevance: serde_json::to_value(passage.relevance)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            score: passage.score,
            excerpt: excerpt(&section.text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSourceDto {
    /// Citation marker, e.g. `W1`
    pub marker: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub query: String,
}

impl WebSourceDto {
    fn from_result(index: usize, result: &WebResult) -> Self {
        Self {
            marker: format!("W{index}"),
            title: result.title.clone(),
            url: result.url.clone(),
            snippet: result.snippet.clone(),
            query: result.query.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSummaryDto {
    pub topic: String,
    /// Discovery queries sent to the paper sources
    pub queries: Vec<String>,
    pub papers_found: usize,
    pub papers_ingested: usize,
    pub papers_skipped: usize,
    pub sections_stored: usize,
    pub sections_new: usize,
    pub sections_filtered: usize,
    pub sections_failed: usize,
    pub warnings: Vec<String>,
}

impl From<&IngestionStats> for IngestionSummaryDto {
    fn from(stats: &IngestionStats) -> Self {
        Self {
            topic: stats.topic.clone(),
            queries: stats.queries.clone(),
            papers_found: stats.papers_found,
            papers_ingested: stats.papers_ingested,
            papers_skipped: stats.papers_skipped,
            sections_stored: stats.sections_stored,
            sections_new: stats.sections_inserted(),
            sections_filtered: stats.sections_filtered,
            sections_failed: stats.sections_failed,
            warnings: stats.warnings.clone(),
        }
    }
}

/// Passage and web source DTOs for an evidence bundle, numbered as cited.
pub fn evidence_sources(bundle: &EvidenceBundle) -> (Vec<PassageDto>, Vec<WebSourceDto>) {
    let passages = bundle
        .passages
        .iter()
        .enumerate()
        .map(|(i, p)| PassageDto::from_passage(i + 1, p))
        .collect();
    let web = bundle
        .web_results
        .iter()
        .enumerate()
        .map(|(i, w)| WebSourceDto::from_result(i + 1, w))
        .collect();
    (passages, web)
}

impl From<AnalysisOutcome> for TurnResponse {
    fn from(outcome: AnalysisOutcome) -> Self {
        let (passages, web) = evidence_sources(&outcome.evidence);
        TurnResponse::Analysis {
            answer: outcome.answer,
            citations: outcome.citations,
            passages,
            web,
            warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

impl From<TurnReply> for TurnResponse {
    fn from(reply: TurnReply) -> Self {
        match reply {
            TurnReply::Completion { text, web_results } => TurnResponse::Completion {
                text,
                sources: web_results
                    .iter()
                    .enumerate()
                    .map(|(i, w)| WebSourceDto::from_result(i + 1, w))
                    .collect(),
            },
            TurnReply::Ingested(stats) => TurnResponse::Ingestion((&stats).into()),
            TurnReply::Analysis {
                outcome,
                knowledge_base_empty,
            } => {
                let mut response = TurnResponse::from(outcome);
                if knowledge_base_empty {
                    if let TurnResponse::Analysis { warnings, .. } = &mut response {
                        warnings.insert(
                            0,
                            "The local knowledge base is empty. Use /search <topic> to add papers.".to_string(),
                        );
                    }
                }
                response
            }
        }
    }
}

impl From<&SessionError> for TurnResponse {
    fn from(error: &SessionError) -> Self {
        TurnResponse::Error {
            message: error.to_string(),
            cancelled: error.is_cancelled(),
        }
    }
}

impl From<Result<TurnReply, SessionError>> for TurnResponse {
    fn from(result: Result<TurnReply, SessionError>) -> Self {
        match result {
            Ok(reply) => reply.into(),
            Err(e) => (&e).into(),
        }
    }
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    crate::orchestrator::prompts::truncate_chars(&flat, EXCERPT_CHARS)
}
