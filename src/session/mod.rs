//! Conversation state and per-turn dispatch.
//!
//! A [`Session`] is the ordered history of one conversation plus its current
//! mode. The [`ResearchTeam`] owns the long-lived collaborators (knowledge
//! base, orchestrator, language model) and handles one turn at a time for
//! whichever session it is given:
//!
//! - `chat`: the language model answers with the recent history and a few
//!   web hits as context
//! - `search`: the ingestion pipeline builds the knowledge base for a topic,
//!   searching the paper sources with queries the language model plans
//! - `analysis`: the orchestrator answers from local and web evidence
//!
//! Dispatch borrows the session mutably, so one session never runs two turns
//! at once; independent sessions can share one team.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingestion::{IngestionError, IngestionPipeline, IngestionStats};
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::models::{ConversationTurn, EvidenceBundle, Mode, WebResult};
use crate::orchestrator::{prompts, request_plan, url_key, AnalysisOutcome, Orchestrator, OrchestratorError, Phase};
use crate::storage::StorageError;
use crate::websearch::WebSearchClient;

/// Session settings, the `[session]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Most recent turns replayed to the model in chat mode
    pub history_window: usize,

    /// Search the web for each chat message and show the hits to the model
    pub chat_web_grounding: bool,

    /// Web queries planned per chat message; 0 searches the message as typed
    pub chat_web_queries: usize,

    /// Hits kept per chat web query
    pub chat_web_results: usize,

    /// Paper-discovery queries planned per `/search` topic; 0 searches the topic as typed
    pub discovery_queries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            chat_web_grounding: true,
            chat_web_queries: 3,
            chat_web_results: 3,
            discovery_queries: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("The language model is unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Knowledge base update failed: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("Could not read the knowledge base: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Analysis(OrchestratorError),

    #[error("Cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SessionError::Cancelled | SessionError::Analysis(OrchestratorError::Cancelled { .. })
        )
    }
}

impl From<OrchestratorError> for SessionError {
    fn from(e: OrchestratorError) -> Self {
        SessionError::Analysis(e)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// History and mode of one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    turns: Vec<ConversationTurn>,
    mode: Mode,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: Mode) -> Self {
        Self {
            turns: Vec::new(),
            mode,
        }
    }

    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The last `window` turns.
    pub fn recent(&self, window: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(window);
        &self.turns[start..]
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mode used for messages without a command prefix.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Evidence behind the most recent analysis answer.
    pub fn last_evidence(&self) -> Option<&Arc<EvidenceBundle>> {
        self.turns.iter().rev().find_map(|turn| turn.evidence.as_ref())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// A message with its dispatch mode resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInput {
    pub mode: Mode,
    pub text: String,
}

impl UserInput {
    /// Resolve the mode of `raw`.
    ///
    /// A leading `/search` or `/analysis` (any case) selects that mode for
    /// this message only; anything else uses `current`.
    pub fn parse(raw: &str, current: Mode) -> Self {
        let trimmed = raw.trim();
        for (prefix, mode) in [("/search", Mode::Search), ("/analysis", Mode::Analysis)] {
            if let Some(rest) = strip_command(trimmed, prefix) {
                return Self {
                    mode,
                    text: rest.trim().to_string(),
                };
            }
        }
        Self {
            mode: current,
            text: trimmed.to_string(),
        }
    }

    /// Resolve `raw` under an explicit mode tag.
    ///
    /// A tag wins over any prefix in the text. Its own command prefix is
    /// stripped when present; a chat tag keeps the text as typed. Without a
    /// tag this is [`UserInput::parse`].
    pub fn resolve(raw: &str, tag: Option<Mode>, current: Mode) -> Self {
        let trimmed = raw.trim();
        let prefix = match tag {
            None => return Self::parse(raw, current),
            Some(Mode::Chat) => None,
            Some(Mode::Search) => Some("/search"),
            Some(Mode::Analysis) => Some("/analysis"),
        };
        let text = prefix
            .and_then(|prefix| strip_command(trimmed, prefix))
            .map(str::trim)
            .unwrap_or(trimmed);
        Self {
            mode: tag.unwrap_or(current),
            text: text.to_string(),
        }
    }
}

/// `text` without `prefix`, if it starts with the whole command word.
fn strip_command<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &text[prefix.len()..];
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

/// What one turn produced.
#[derive(Debug, Clone)]
pub enum TurnReply {
    Completion {
        text: String,
        /// Web hits shown to the model, when chat grounding is on
        web_results: Vec<WebResult>,
    },
    Ingested(IngestionStats),
    Analysis {
        outcome: AnalysisOutcome,
        /// The local knowledge base had no sections when the run started
        knowledge_base_empty: bool,
    },
}

impl TurnReply {
    /// Text recorded as the assistant turn.
    pub fn summary(&self) -> String {
        match self {
            TurnReply::Completion { text, .. } => text.clone(),
            TurnReply::Ingested(stats) => ingestion_summary(stats),
            TurnReply::Analysis { outcome, .. } => outcome.answer.clone(),
        }
    }
}

fn ingestion_summary(stats: &IngestionStats) -> String {
    if stats.sections_stored == 0 {
        return format!(
            "No sections were stored for \"{}\" ({} papers found, {} skipped).",
            stats.topic, stats.papers_found, stats.papers_skipped
        );
    }
    format!(
        "Stored {} sections from {} papers on \"{}\". You can now ask questions with /analysis.",
        stats.sections_stored, stats.papers_ingested, stats.topic
    )
}

/// The long-lived collaborators that answer turns.
pub struct ResearchTeam {
    ingestion: IngestionPipeline,
    orchestrator: Orchestrator,
    llm: Arc<dyn LlmClient>,
    web: Arc<dyn WebSearchClient>,
    config: SessionConfig,
}

impl ResearchTeam {
    pub fn new(
        ingestion: IngestionPipeline,
        orchestrator: Orchestrator,
        llm: Arc<dyn LlmClient>,
        web: Arc<dyn WebSearchClient>,
        config: SessionConfig,
    ) -> Self {
        Self {
            ingestion,
            orchestrator,
            llm,
            web,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Whether the knowledge base holds any section.
    pub async fn knowledge_base_ready(&self) -> SessionResult<bool> {
        Ok(self.ingestion.storage().count_sections().await? > 0)
    }

    pub async fn section_count(&self) -> SessionResult<usize> {
        Ok(self.ingestion.storage().count_sections().await?)
    }

    /// Delete every stored section.
    pub async fn reset_knowledge_base(&self) -> SessionResult<()> {
        self.ingestion.reset().await?;
        Ok(())
    }

    /// Handle one user message, reading its mode from a command prefix.
    pub async fn handle_turn(
        &self,
        session: &mut Session,
        raw: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<TurnReply> {
        let input = UserInput::parse(raw, session.mode());
        self.handle_input(session, input, cancel).await
    }

    /// Handle one message whose mode is already resolved.
    ///
    /// On success the user message and the reply are appended to `session`.
    /// Failed or cancelled turns leave the history untouched.
    pub async fn handle_input(
        &self,
        session: &mut Session,
        input: UserInput,
        cancel: &CancellationToken,
    ) -> SessionResult<TurnReply> {
        if input.text.is_empty() {
            return Err(SessionError::InvalidInput(match input.mode {
                Mode::Search => "Usage: /search <topic>".to_string(),
                Mode::Analysis => "Usage: /analysis <question>".to_string(),
                Mode::Chat => "Message is empty.".to_string(),
            }));
        }
        debug!(mode = %input.mode, "dispatching turn");

        let reply = match input.mode {
            Mode::Chat => self.chat(session, &input.text, cancel).await?,
            Mode::Search => self.search(&input.text, cancel).await?,
            Mode::Analysis => self.analyze(&input.text, cancel).await?,
        };

        session.append(ConversationTurn::user(input.mode, input.text));
        let mut answer = ConversationTurn::assistant(input.mode, reply.summary());
        if let TurnReply::Analysis { outcome, .. } = &reply {
            answer = answer.with_evidence(outcome.evidence.clone());
        }
        session.append(answer);

        Ok(reply)
    }

    async fn chat(&self, session: &Session, message: &str, cancel: &CancellationToken) -> SessionResult<TurnReply> {
        let web_results = if self.config.chat_web_grounding {
            self.ground(message, cancel).await?
        } else {
            Vec::new()
        };

        let request = prompts::chat_request(session.recent(self.config.history_window), message, &web_results);
        let limit = Duration::from_millis(self.orchestrator.config().llm_timeout_ms);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            outcome = tokio::time::timeout(limit, self.llm.complete(&request)) => outcome,
        };

        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(TurnReply::Completion {
                text: text.trim().to_string(),
                web_results,
            }),
            Ok(Ok(_)) => Err(SessionError::LlmUnavailable("the model returned an empty reply".to_string())),
            Ok(Err(LlmError::Unavailable(msg))) => Err(SessionError::LlmUnavailable(msg)),
            Ok(Err(e)) => Err(SessionError::LlmUnavailable(e.to_string())),
            Err(_) => Err(SessionError::LlmUnavailable("the model took too long to answer".to_string())),
        }
    }

    /// Web hits for a chat message; failures only cost the grounding.
    async fn ground(&self, message: &str, cancel: &CancellationToken) -> SessionResult<Vec<WebResult>> {
        let max = self.config.chat_web_queries;
        let queries = if max > 0 {
            self.plan(prompts::chat_queries_request(message, max), max, message, cancel)
                .await?
        } else {
            vec![message.to_string()]
        };

        let orchestrator = self.orchestrator.config();
        let limit = Duration::from_millis(orchestrator.search_timeout_ms);
        let per_query = self.config.chat_web_results;
        let web = &self.web;

        let searches = stream::iter(queries)
            .map(|query| async move {
                let outcome = tokio::time::timeout(limit, web.search(&query, per_query)).await;
                (query, outcome)
            })
            .buffered(orchestrator.web_concurrency.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            outcomes = searches => outcomes,
        };

        let mut seen_urls = HashSet::new();
        let mut results = Vec::new();
        for (query, outcome) in outcomes {
            match outcome {
                Ok(Ok(hits)) => results.extend(
                    hits.into_iter()
                        .take(per_query)
                        .filter(|hit| seen_urls.insert(url_key(&hit.url))),
                ),
                Ok(Err(e)) => warn!(%query, error = %e, "chat web grounding failed"),
                Err(_) => warn!(%query, "chat web grounding timed out"),
            }
        }
        Ok(results)
    }

    /// Ask the language model for search queries, once.
    ///
    /// Any failure falls back to searching `fallback` as typed.
    async fn plan(
        &self,
        request: CompletionRequest,
        max: usize,
        fallback: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<Vec<String>> {
        let limit = Duration::from_millis(self.orchestrator.config().llm_timeout_ms);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            outcome = tokio::time::timeout(limit, request_plan(self.llm.as_ref(), &request, max)) => outcome,
        };

        match outcome {
            Ok(Ok(Some(plan))) => {
                debug!(queries = ?plan.queries(), "search queries planned");
                return Ok(plan.into_queries());
            }
            Ok(Ok(None)) => warn!("query planner returned no usable queries"),
            Ok(Err(e)) => warn!(error = %e, "query planning failed"),
            Err(_) => warn!("query planning timed out"),
        }
        Ok(vec![fallback.to_string()])
    }

    async fn search(&self, topic: &str, cancel: &CancellationToken) -> SessionResult<TurnReply> {
        let max = self.config.discovery_queries;
        let queries = if max > 0 {
            self.plan(prompts::discovery_request(topic, max), max, topic, cancel).await?
        } else {
            vec![topic.to_string()]
        };

        let stats = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            stats = self.ingestion.ingest_queries(topic, &queries) => stats?,
        };
        info!(topic, queries = stats.queries.len(), sections = stats.sections_stored, "knowledge base updated");
        Ok(TurnReply::Ingested(stats))
    }

    async fn analyze(&self, question: &str, cancel: &CancellationToken) -> SessionResult<TurnReply> {
        let knowledge_base_empty = !self.knowledge_base_ready().await?;
        if knowledge_base_empty {
            warn!("knowledge base is empty, analysis will rely on web evidence");
        }
        let outcome = self.orchestrator.analyze(question, cancel).await?;
        Ok(TurnReply::Analysis {
            outcome,
            knowledge_base_empty,
        })
    }
}

/// Phase a cancelled analysis stopped in, if the error is one.
pub fn cancelled_phase(error: &SessionError) -> Option<Phase> {
    match error {
        SessionError::Analysis(OrchestratorError::Cancelled { phase }) => Some(*phase),
        _ => None,
    }
}
