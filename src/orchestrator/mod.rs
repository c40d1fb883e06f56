//! Multi-agent analysis pipeline.
//!
//! An analysis runs three agents in a fixed order:
//!
//! 1. **Librarian** (`Phase::LocalRetrieval`): nearest passages from the
//!    local knowledge base.
//! 2. **Web Researcher** (`Phase::QueryExpansion`, `Phase::WebRetrieval`):
//!    the language model proposes web queries, which run concurrently.
//! 3. **Lead Analyst** (`Phase::Synthesis`): one Markdown answer citing the
//!    evidence as `[P#]` and `[W#]`.
//!
//! Missing evidence never aborts a run; it is recorded as an
//! [`EvidenceWarning`]. The only terminal failures are a synthesis that
//! produces nothing twice and cancellation.

pub mod prompts;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{complete_structured, CompletionRequest, LlmClient, LlmError, LlmResult};
use crate::models::{EvidenceBundle, RetrievedPassage, WebResult};
use crate::retrieval::{RetrievalError, Retriever};
use crate::websearch::{WebSearchClient, WebSearchError};

/// Orchestrator settings, the `[orchestrator]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Passages retrieved from the knowledge base
    pub top_k: usize,

    /// Upper bound on queries produced by query expansion
    pub max_web_queries: usize,

    pub results_per_query: usize,

    /// Web queries in flight at once
    pub web_concurrency: usize,

    pub embed_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub search_timeout_ms: u64,

    /// Characters of local context shown to the query planner
    pub local_context_chars: usize,

    /// Characters of each passage shown to the analyst
    pub passage_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_web_queries: 3,
            results_per_query: 3,
            web_concurrency: 2,
            embed_timeout_ms: 30_000,
            llm_timeout_ms: 120_000,
            search_timeout_ms: 15_000,
            local_context_chars: 1_000,
            passage_chars: 1_500,
        }
    }
}

impl OrchestratorConfig {
    fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

/// Stage of an analysis run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LocalRetrieval,
    QueryExpansion,
    WebRetrieval,
    Synthesis,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Idle => Phase::LocalRetrieval,
            Phase::LocalRetrieval => Phase::QueryExpansion,
            Phase::QueryExpansion => Phase::WebRetrieval,
            Phase::WebRetrieval => Phase::Synthesis,
            Phase::Synthesis => Phase::Idle,
        }
    }

    /// The agent working in this phase.
    pub fn agent(self) -> &'static str {
        match self {
            Phase::Idle => "Project Manager",
            Phase::LocalRetrieval => "Librarian",
            Phase::QueryExpansion | Phase::WebRetrieval => "Web Researcher",
            Phase::Synthesis => "Lead Analyst",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::LocalRetrieval => "local retrieval",
            Phase::QueryExpansion => "query expansion",
            Phase::WebRetrieval => "web retrieval",
            Phase::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failures of an analysis run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The analyst produced no answer, even after one retry
    #[error("The analysis could not be written: {0}")]
    SynthesisFailed(String),

    #[error("Analysis cancelled during {phase}")]
    Cancelled { phase: Phase },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Why a local retrieval produced no evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalFailure {
    EmbeddingUnavailable,
    EmbeddingFailed,
    InvalidQuestion,
    TimedOut,
    StorageError,
}

/// Why a step of the web research fell short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailure {
    Unavailable,
    TimedOut,
    MalformedOutput,
}

/// Recovered problem with the evidence of one run, shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceWarning {
    LocalUnavailable { cause: LocalFailure },
    NoLocalEvidence,
    QueryExpansionFallback { cause: RemoteFailure },
    WebQueryFailed { query: String, cause: RemoteFailure },
    WebUnavailable,
    NoWebEvidence,
}

impl fmt::Display for EvidenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceWarning::LocalUnavailable { cause } => {
                let why = match cause {
                    LocalFailure::EmbeddingUnavailable => "the embedding service could not be reached",
                    LocalFailure::EmbeddingFailed => "the embedding service rejected the question",
                    LocalFailure::InvalidQuestion => "the question has no searchable text",
                    LocalFailure::TimedOut => "the search took too long",
                    LocalFailure::StorageError => "the knowledge base could not be read",
                };
                write!(f, "Local papers were not consulted: {why}.")
            }
            EvidenceWarning::NoLocalEvidence => {
                f.write_str("No relevant passages were found in the local knowledge base.")
            }
            EvidenceWarning::QueryExpansionFallback { cause } => {
                let why = match cause {
                    RemoteFailure::Unavailable => "the language model was unavailable",
                    RemoteFailure::TimedOut => "the language model took too long",
                    RemoteFailure::MalformedOutput => "the language model did not return usable queries",
                };
                write!(f, "Searched the web with the question itself because {why}.")
            }
            EvidenceWarning::WebQueryFailed { query, cause } => {
                let why = match cause {
                    RemoteFailure::TimedOut => "timed out",
                    _ => "failed",
                };
                write!(f, "Web search for \"{query}\" {why}.")
            }
            EvidenceWarning::WebUnavailable => {
                f.write_str("Web search was unavailable; the answer uses local papers only.")
            }
            EvidenceWarning::NoWebEvidence => f.write_str("The web search returned no results."),
        }
    }
}

/// Source an answer cites, resolved from a `[P#]` or `[W#]` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Citation {
    Passage {
        marker: String,
        paper_id: String,
        section_name: String,
        paper_title: String,
        url: String,
    },
    Web {
        marker: String,
        title: String,
        url: String,
    },
}

impl Citation {
    pub fn marker(&self) -> &str {
        match self {
            Citation::Passage { marker, .. } | Citation::Web { marker, .. } => marker,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Citation::Passage { url, .. } | Citation::Web { url, .. } => url,
        }
    }
}

/// Progress notification sent while a run is underway.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    Entered(Phase),
    PassagesFound(usize),
    QueriesPlanned(Vec<String>),
    WebResultsFound(usize),
    Warning(EvidenceWarning),
    Completed,
}

/// Result of a successful analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    /// Markdown answer as written by the analyst
    pub answer: String,

    /// Sources cited in `answer`, in order of first citation
    pub citations: Vec<Citation>,

    pub evidence: Arc<EvidenceBundle>,

    /// Web queries that were issued
    pub queries: Vec<String>,

    pub warnings: Vec<EvidenceWarning>,

    /// Phases visited, in order
    pub phases: Vec<Phase>,
}

/// Shape accepted from the query planner.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpansionReply {
    Object { queries: Vec<String> },
    List(Vec<String>),
}

/// Validated web queries: trimmed, non-empty, unique, at most the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionPlan {
    queries: Vec<String>,
}

impl ExpansionPlan {
    /// Clean up raw queries; `None` when nothing usable is left.
    pub fn from_raw<I, S>(raw: I, max: usize) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let queries: Vec<String> = raw
            .into_iter()
            .map(|q| q.as_ref().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|q| !q.is_empty())
            .filter(|q| seen.insert(q.to_lowercase()))
            .take(max)
            .collect();
        (!queries.is_empty()).then_some(Self { queries })
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn into_queries(self) -> Vec<String> {
        self.queries
    }
}

/// Ask the language model for a query plan, once.
///
/// `Ok(None)` means the reply parsed but held no usable query.
pub(crate) async fn request_plan(
    llm: &dyn LlmClient,
    request: &CompletionRequest,
    max: usize,
) -> LlmResult<Option<ExpansionPlan>> {
    let reply = complete_structured::<ExpansionReply>(llm, request).await?;
    Ok(ExpansionPlan::from_raw(reply.into_raw(), max))
}

impl ExpansionReply {
    fn into_raw(self) -> Vec<String> {
        match self {
            ExpansionReply::Object { queries } | ExpansionReply::List(queries) => queries,
        }
    }
}

/// Mutable bookkeeping of one run.
struct Run {
    current: Phase,
    phases: Vec<Phase>,
    warnings: Vec<EvidenceWarning>,
}

/// Runs the Librarian, Web Researcher and Lead Analyst in sequence.
pub struct Orchestrator {
    retriever: Arc<dyn Retriever>,
    llm: Arc<dyn LlmClient>,
    web: Arc<dyn WebSearchClient>,
    config: OrchestratorConfig,
    progress_tx: Option<mpsc::UnboundedSender<PhaseEvent>>,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        llm: Arc<dyn LlmClient>,
        web: Arc<dyn WebSearchClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            retriever,
            llm,
            web,
            config,
            progress_tx: None,
        }
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<PhaseEvent>) {
        self.progress_tx = Some(tx);
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn send_progress(&self, event: PhaseEvent) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(event);
        }
    }

    /// Answer `question` from local and web evidence.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Cancelled` if `cancel` fires before the
    /// answer is complete, and `OrchestratorError::SynthesisFailed` if the
    /// analyst cannot produce an answer
    pub async fn analyze(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<AnalysisOutcome> {
        let question = question.trim();
        let mut run = Run {
            current: Phase::Idle,
            phases: Vec::with_capacity(4),
            warnings: Vec::new(),
        };
        info!(question, "analysis started");

        self.enter(&mut run, Phase::LocalRetrieval, cancel)?;
        let passages = self.local_retrieval(question, &mut run, cancel).await?;

        self.enter(&mut run, Phase::QueryExpansion, cancel)?;
        let queries = self.expand_queries(question, &passages, &mut run, cancel).await?;

        self.enter(&mut run, Phase::WebRetrieval, cancel)?;
        let web_results = self.web_retrieval(&queries, &mut run, cancel).await?;

        self.enter(&mut run, Phase::Synthesis, cancel)?;
        let evidence = Arc::new(EvidenceBundle {
            question: question.to_string(),
            passages,
            web_results,
        });
        let answer = self.synthesize(&evidence, cancel).await?;
        let citations = resolve_citations(&answer, &evidence);

        run.current = run.current.next();
        self.send_progress(PhaseEvent::Completed);
        info!(
            passages = evidence.passages.len(),
            web_results = evidence.web_results.len(),
            citations = citations.len(),
            warnings = run.warnings.len(),
            "analysis finished"
        );

        Ok(AnalysisOutcome {
            answer,
            citations,
            evidence,
            queries,
            warnings: run.warnings,
            phases: run.phases,
        })
    }

    /// Cross a phase boundary; this is where cancellation is observed.
    fn enter(&self, run: &mut Run, phase: Phase, cancel: &CancellationToken) -> OrchestratorResult<()> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled { phase: run.current });
        }
        debug_assert_eq!(run.current.next(), phase, "phases only move forward");
        run.current = phase;
        run.phases.push(phase);
        debug!(%phase, agent = phase.agent(), "entering phase");
        self.send_progress(PhaseEvent::Entered(phase));
        Ok(())
    }

    fn record(&self, run: &mut Run, warning: EvidenceWarning) {
        warn!(phase = %run.current, "{warning}");
        self.send_progress(PhaseEvent::Warning(warning.clone()));
        run.warnings.push(warning);
    }

    /// Await `fut` under a timeout, giving up as soon as `cancel` fires.
    async fn guarded<F, T>(
        &self,
        phase: Phase,
        limit: Duration,
        cancel: &CancellationToken,
        fut: F,
    ) -> OrchestratorResult<Result<T, Elapsed>>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled { phase }),
            result = tokio::time::timeout(limit, fut) => Ok(result),
        }
    }

    async fn local_retrieval(
        &self,
        question: &str,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Vec<RetrievedPassage>> {
        let call = self.retriever.retrieve(question, self.config.top_k, None);
        let outcome = self
            .guarded(Phase::LocalRetrieval, self.config.embed_timeout(), cancel, call)
            .await?;

        let passages = match outcome {
            Ok(Ok(passages)) => passages,
            Ok(Err(RetrievalError::EmbeddingUnavailable(msg))) => {
                debug!(error = %msg, "embedding unavailable during retrieval");
                self.record(run, EvidenceWarning::LocalUnavailable { cause: LocalFailure::EmbeddingUnavailable });
                return Ok(Vec::new());
            }
            Ok(Err(e)) => {
                debug!(error = %e, "local retrieval failed");
                let cause = match e {
                    RetrievalError::StorageError(_) => LocalFailure::StorageError,
                    RetrievalError::InvalidQuery(_) => LocalFailure::InvalidQuestion,
                    RetrievalError::EmbeddingError(_) => LocalFailure::EmbeddingFailed,
                    RetrievalError::EmbeddingUnavailable(_) => LocalFailure::EmbeddingUnavailable,
                };
                self.record(run, EvidenceWarning::LocalUnavailable { cause });
                return Ok(Vec::new());
            }
            Err(_) => {
                self.record(run, EvidenceWarning::LocalUnavailable { cause: LocalFailure::TimedOut });
                return Ok(Vec::new());
            }
        };

        if passages.is_empty() {
            self.record(run, EvidenceWarning::NoLocalEvidence);
        }
        self.send_progress(PhaseEvent::PassagesFound(passages.len()));
        Ok(passages)
    }

    async fn expand_queries(
        &self,
        question: &str,
        passages: &[RetrievedPassage],
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Vec<String>> {
        let max = self.config.max_web_queries;
        let mut cause = RemoteFailure::MalformedOutput;

        for strict in [false, true] {
            let request = prompts::expansion_request(
                question,
                passages,
                max,
                self.config.local_context_chars,
                strict,
            );
            let call = request_plan(self.llm.as_ref(), &request, max);
            let outcome = self
                .guarded(Phase::QueryExpansion, self.config.llm_timeout(), cancel, call)
                .await?;

            match outcome {
                Ok(Ok(Some(plan))) => {
                    debug!(queries = ?plan.queries(), strict, "query expansion succeeded");
                    let queries = plan.into_queries();
                    self.send_progress(PhaseEvent::QueriesPlanned(queries.clone()));
                    return Ok(queries);
                }
                Ok(Ok(None)) => debug!(strict, "query planner returned no usable queries"),
                Ok(Err(LlmError::MalformedOutput(msg))) => {
                    debug!(strict, error = %msg, "query planner reply was malformed");
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "query planner unavailable");
                    cause = RemoteFailure::Unavailable;
                    break;
                }
                Err(_) => {
                    cause = RemoteFailure::TimedOut;
                    break;
                }
            }
        }

        self.record(run, EvidenceWarning::QueryExpansionFallback { cause });
        let queries = vec![question.to_string()];
        self.send_progress(PhaseEvent::QueriesPlanned(queries.clone()));
        Ok(queries)
    }

    async fn web_retrieval(
        &self,
        queries: &[String],
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Vec<WebResult>> {
        let per_query = self.config.results_per_query;
        let limit = self.config.search_timeout();
        let web = &self.web;

        let searches = stream::iter(queries.iter().cloned())
            .map(|query| async move {
                let result = tokio::time::timeout(limit, web.search(&query, per_query)).await;
                (query, result)
            })
            .buffered(self.config.web_concurrency.max(1))
            .collect::<Vec<_>>();

        let outcomes: Vec<(String, Result<Result<Vec<WebResult>, WebSearchError>, Elapsed>)> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled { phase: Phase::WebRetrieval }),
            outcomes = searches => outcomes,
        };

        let mut seen_urls = HashSet::new();
        let mut results = Vec::new();
        let mut failed = 0;
        for (query, outcome) in outcomes {
            let hits = match outcome {
                Ok(Ok(hits)) => hits,
                Ok(Err(e)) => {
                    debug!(%query, error = %e, "web query failed");
                    failed += 1;
                    self.record(run, EvidenceWarning::WebQueryFailed { query, cause: RemoteFailure::Unavailable });
                    continue;
                }
                Err(_) => {
                    failed += 1;
                    self.record(run, EvidenceWarning::WebQueryFailed { query, cause: RemoteFailure::TimedOut });
                    continue;
                }
            };
            for hit in hits.into_iter().take(per_query) {
                if seen_urls.insert(url_key(&hit.url)) {
                    results.push(hit);
                }
            }
        }

        if !queries.is_empty() && failed == queries.len() {
            self.record(run, EvidenceWarning::WebUnavailable);
        } else if results.is_empty() {
            self.record(run, EvidenceWarning::NoWebEvidence);
        }
        self.send_progress(PhaseEvent::WebResultsFound(results.len()));
        Ok(results)
    }

    async fn synthesize(&self, evidence: &EvidenceBundle, cancel: &CancellationToken) -> OrchestratorResult<String> {
        let request = prompts::synthesis_request(evidence, self.config.passage_chars);
        let mut last_failure = String::new();

        for attempt in 1..=2 {
            let outcome = self
                .guarded(Phase::Synthesis, self.config.llm_timeout(), cancel, self.llm.complete(&request))
                .await?;
            match outcome {
                Ok(Ok(answer)) if !answer.trim().is_empty() => return Ok(answer.trim().to_string()),
                Ok(Ok(_)) => last_failure = "the language model returned an empty answer".to_string(),
                Ok(Err(LlmError::Unavailable(_))) => {
                    last_failure = "the language model was unavailable".to_string()
                }
                Ok(Err(e)) => last_failure = format!("the language model failed ({e})"),
                Err(_) => last_failure = "the language model took too long".to_string(),
            }
            warn!(attempt, reason = %last_failure, "synthesis attempt failed");
        }

        Err(OrchestratorError::SynthesisFailed(last_failure))
    }
}

/// Normalized form of a URL used to drop repeated web results.
pub(crate) fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

static MARKER_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[((?:\s*[PW]\d+\s*,?)+)\]").expect("marker group regex"));
static MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([PW])(\d+)").expect("marker regex"));

/// Resolve the `[P#]`/`[W#]` markers in `answer` against `evidence`.
///
/// Markers that point outside the evidence are ignored. Each source is
/// listed once, at its first citation.
pub fn resolve_citations(answer: &str, evidence: &EvidenceBundle) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut citations = Vec::new();

    for group in MARKER_GROUP.captures_iter(answer) {
        for marker in MARKER.captures_iter(&group[1]) {
            let Ok(index) = marker[2].parse::<usize>() else {
                continue;
            };
            let label = format!("{}{}", &marker[1], index);
            if seen.contains(&label) {
                continue;
            }
            let citation = match &marker[1] {
                "P" => evidence.passage(index).map(|p| Citation::Passage {
                    marker: label.clone(),
                    paper_id: p.section.key.paper_id.clone(),
                    section_name: p.section.key.section_name.clone(),
                    paper_title: p.section.paper_title.clone(),
                    url: p.section.paper_url.clone(),
                }),
                _ => evidence.web_result(index).map(|w| Citation::Web {
                    marker: label.clone(),
                    title: w.title.clone(),
                    url: w.url.clone(),
                }),
            };
            match citation {
                Some(citation) => {
                    seen.insert(label);
                    citations.push(citation);
                }
                None => debug!(marker = %label, "answer cites unknown evidence"),
            }
        }
    }
    citations
}
