//! Test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::llm::{CompletionRequest, LlmClient, LlmError, LlmResult};
use crate::models::{EmbeddingConfig, PaperMetadata, PaperSection, SectionKey, SimilarityMetric, WebResult};
use crate::websearch::{WebSearchClient, WebSearchError, WebSearchResult};

/// Words the mock embedding projects onto; one axis each plus a bias axis.
const VOCABULARY: [&str; 7] = ["graph", "dynamic", "temporal", "neural", "language", "attention", "protein"];

pub const MOCK_DIMENSION: usize = VOCABULARY.len() + 1;

/// Deterministic keyword embedding: texts sharing vocabulary words are close.
#[derive(Clone, Default)]
pub struct MockEmbedding {
    state: Arc<Mutex<MockEmbeddingState>>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct MockEmbeddingState {
    embed_calls: Vec<String>,
    batch_calls: Vec<Vec<String>>,
    unavailable: bool,
    batch_fails: bool,
    fail_on_text: Option<String>,
}

impl MockEmbedding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().unavailable = true;
        mock
    }

    /// `embed_batch` answers with an API error; single `embed` still works.
    pub fn with_failing_batches(self) -> Self {
        self.state.lock().unwrap().batch_fails = true;
        self
    }

    pub fn fail_on_text(self, needle: &str) -> Self {
        self.state.lock().unwrap().fail_on_text = Some(needle.to_string());
        self
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn embed_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().embed_calls.clone()
    }

    pub fn batch_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().batch_calls.clone()
    }

    pub fn config() -> EmbeddingConfig {
        EmbeddingConfig {
            model_name: "mock-keywords".to_string(),
            dimension: MOCK_DIMENSION,
            metric: SimilarityMetric::Cosine,
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = VOCABULARY
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect();
        v.push(0.1);
        v
    }

    fn check(state: &MockEmbeddingState, text: &str) -> EmbeddingResult<()> {
        if state.unavailable {
            return Err(EmbeddingError::Unavailable("connection refused".to_string()));
        }
        if let Some(needle) = &state.fail_on_text {
            if text.contains(needle.as_str()) {
                return Err(EmbeddingError::ApiError(format!("rejected text containing '{needle}'")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.embed_calls.push(text.to_string());
        Self::check(&state, text)?;
        Ok(Self::vector(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.batch_calls.push(texts.iter().map(|t| t.to_string()).collect());
        if state.batch_fails {
            return Err(EmbeddingError::ApiError("batch endpoint failed".to_string()));
        }
        for text in texts {
            Self::check(&state, text)?;
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        MOCK_DIMENSION
    }

    fn model_name(&self) -> &str {
        "mock-keywords"
    }
}

/// Language model that replays a script of replies and records every request.
///
/// Once the script runs out every call fails with `LlmError::Unavailable`.
/// A call that is dropped while it sleeps leaves its reply in the script.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    replies: Arc<Mutex<VecDeque<LlmResult<String>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    delays: Arc<Mutex<VecDeque<Duration>>>,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<LlmResult<String>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Per-call delays, in call order; later calls use `with_delay` or none.
    pub fn with_delays<I>(self, delays: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
    {
        self.delays.lock().unwrap().extend(delays);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = self.delays.lock().unwrap().pop_front().or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unavailable("script exhausted".to_string())))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Web search returning canned hits per query.
#[derive(Clone, Default)]
pub struct MockWebSearch {
    hits: Arc<HashMap<String, Vec<(String, String, String)>>>,
    failing: Arc<HashSet<String>>,
    fail_all: bool,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockWebSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_everything() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Register a hit `(title, snippet, url)` for `query`.
    pub fn with_hit(mut self, query: &str, title: &str, snippet: &str, url: &str) -> Self {
        Arc::make_mut(&mut self.hits)
            .entry(query.to_string())
            .or_default()
            .push((title.to_string(), snippet.to_string(), url.to_string()));
        self
    }

    pub fn failing_on(mut self, query: &str) -> Self {
        Arc::make_mut(&mut self.failing).insert(query.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearchClient for MockWebSearch {
    async fn search(&self, query: &str, max_results: usize) -> WebSearchResult<Vec<WebResult>> {
        self.calls.lock().unwrap().push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all || self.failing.contains(query) {
            return Err(WebSearchError::Unavailable("rate limited".to_string()));
        }
        Ok(self
            .hits
            .get(query)
            .into_iter()
            .flatten()
            .take(max_results)
            .enumerate()
            .map(|(i, (title, snippet, url))| WebResult {
                query: query.to_string(),
                title: title.clone(),
                snippet: snippet.clone(),
                url: url.clone(),
                rank: i + 1,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A stored section embedded with [`MockEmbedding::vector`].
pub fn embedded_section(paper_id: &str, name: &str, text: &str) -> PaperSection {
    PaperSection {
        key: SectionKey::new(paper_id, name),
        paper_title: format!("Paper {paper_id}"),
        paper_url: format!("https://arxiv.org/abs/{paper_id}"),
        text: text.to_string(),
        embedding: MockEmbedding::vector(text),
        metadata: PaperMetadata::default(),
    }
}
