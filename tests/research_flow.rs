//! End-to-end tests driving the public API: a paper library on disk, the
//! ingestion pipeline, and the research team answering turns with scripted
//! collaborators.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use research_team::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use research_team::ingestion::{IngestionConfig, IngestionPipeline, PaperSources};
use research_team::llm::{CompletionRequest, LlmClient, LlmError, LlmResult};
use research_team::models::{Mode, SimilarityMetric, WebResult};
use research_team::orchestrator::{Citation, EvidenceWarning, Orchestrator, OrchestratorConfig, OrchestratorError};
use research_team::provider::json::JsonPaperLibrary;
use research_team::retrieval::{RetrievalEngine, Retriever};
use research_team::session::{ResearchTeam, Session, SessionConfig, SessionError, TurnReply};
use research_team::storage::memory::InMemoryStore;
use research_team::storage::sqlite::SqliteStorage;
use research_team::storage::SectionStore;
use research_team::websearch::{WebSearchClient, WebSearchError, WebSearchResult};
use research_team::TurnResponse;
use tokio_util::sync::CancellationToken;

const WORDS: [&str; 6] = ["graph", "dynamic", "temporal", "neural", "attention", "protein"];

/// Bag-of-keywords embedding; deterministic and good enough to rank.
struct KeywordEmbedding;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty".to_string()));
        }
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = WORDS.iter().map(|w| lower.matches(w).count() as f32).collect();
        v.push(0.1);
        Ok(v)
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        WORDS.len() + 1
    }

    fn model_name(&self) -> &str {
        "keywords"
    }
}

#[derive(Clone, Default)]
struct ScriptedLlm {
    replies: Arc<Mutex<VecDeque<LlmResult<String>>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect())),
            ..Self::default()
        }
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<String> {
        let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unavailable("no more replies".to_string())))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct StaticWeb {
    hits: HashMap<String, Vec<(String, String)>>,
    down: bool,
}

impl StaticWeb {
    fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    fn hit(mut self, query: &str, title: &str, url: &str) -> Self {
        self.hits
            .entry(query.to_string())
            .or_default()
            .push((title.to_string(), url.to_string()));
        self
    }
}

#[async_trait]
impl WebSearchClient for StaticWeb {
    async fn search(&self, query: &str, max_results: usize) -> WebSearchResult<Vec<WebResult>> {
        if self.down {
            return Err(WebSearchError::Unavailable("HTTP 429".to_string()));
        }
        Ok(self
            .hits
            .get(query)
            .into_iter()
            .flatten()
            .take(max_results)
            .enumerate()
            .map(|(i, (title, url))| WebResult {
                query: query.to_string(),
                title: title.clone(),
                snippet: format!("About {title}"),
                url: url.clone(),
                rank: i + 1,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "static"
    }
}

fn write_paper(dir: &Path, id: &str, title: &str, sections: &[(&str, &str)]) {
    let filler = "This sentence pads the section to a realistic length. ".repeat(8);
    let sections: Vec<_> = sections
        .iter()
        .map(|(name, text)| serde_json::json!({ "title": name, "content": format!("{text} {filler}") }))
        .collect();
    let paper = serde_json::json!({
        "title": title,
        "link": format!("https://arxiv.org/abs/{id}"),
        "authors": "Ada Lovelace, Alan Turing",
        "year": 2020,
        "sections": sections,
    });
    std::fs::write(dir.join(format!("{id}.json")), paper.to_string()).unwrap();
}

async fn gnn_library() -> (tempfile::TempDir, JsonPaperLibrary) {
    let dir = tempfile::tempdir().unwrap();
    write_paper(
        dir.path(),
        "2006.10637",
        "Temporal Graph Networks for Deep Learning on Dynamic Graphs",
        &[
            ("Introduction", "Graph neural networks on dynamic graph data with temporal events."),
            ("Memory", "Each node keeps a temporal memory updated by graph events."),
            ("References", "[1] Kipf and Welling. Semi-supervised classification with graph convolutional networks."),
        ],
    );
    write_paper(
        dir.path(),
        "1710.10903",
        "Graph Attention Networks",
        &[("Method", "Attention over graph neighbourhoods in neural networks.")],
    );
    write_paper(
        dir.path(),
        "2101.00001",
        "Protein Folding at Scale",
        &[("Introduction", "Protein structure prediction.")],
    );
    let library = JsonPaperLibrary::open(dir.path()).await.unwrap();
    (dir, library)
}

async fn build_team(store: Arc<dyn SectionStore>, llm: ScriptedLlm, web: StaticWeb) -> ResearchTeam {
    let (_dir, library) = gnn_library().await;
    let embedding: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedding);
    let pipeline = IngestionPipeline::open(
        embedding.clone(),
        store.clone(),
        PaperSources::from_shared(Arc::new(library)),
        IngestionConfig::default(),
        SimilarityMetric::Cosine,
    )
    .await
    .unwrap();

    let llm: Arc<dyn LlmClient> = Arc::new(llm);
    let web: Arc<dyn WebSearchClient> = Arc::new(web);
    let orchestrator = Orchestrator::new(
        Arc::new(RetrievalEngine::new(embedding, store)),
        llm.clone(),
        web.clone(),
        OrchestratorConfig::default(),
    );
    ResearchTeam::new(pipeline, orchestrator, llm, web, SessionConfig::default())
}

#[tokio::test]
async fn ingestion_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let team = build_team(store.clone(), ScriptedLlm::default(), StaticWeb::default()).await;
    let mut session = Session::new();
    let cancel = CancellationToken::new();

    let first = team.handle_turn(&mut session, "/search graph neural networks", &cancel).await.unwrap();
    let TurnReply::Ingested(first) = first else {
        panic!("expected ingestion");
    };
    // no planner reply, so the topic is searched as typed
    assert_eq!(first.queries, vec!["graph neural networks"]);
    assert_eq!(first.papers_ingested, 2);
    assert_eq!(first.sections_stored, 3);
    assert_eq!(first.sections_filtered, 1);
    let count = store.count_sections().await.unwrap();
    assert_eq!(count, 3);

    let second = team.handle_turn(&mut session, "/search graph neural networks", &cancel).await.unwrap();
    let TurnReply::Ingested(second) = second else {
        panic!("expected ingestion");
    };
    assert_eq!(second.sections_stored, 3);
    assert_eq!(second.sections_inserted(), 0);
    assert_eq!(store.count_sections().await.unwrap(), count);
    assert_eq!(store.paper_ids().await.unwrap(), vec!["1710.10903", "2006.10637"]);
}

#[tokio::test]
async fn planned_discovery_queries_widen_the_search() {
    let store = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlm::replying(&[r#"{"queries": ["temporal memory", "attention", "temporal graph attention"]}"#]);
    let team = build_team(store.clone(), llm.clone(), StaticWeb::default()).await;

    let reply = team
        .handle_turn(&mut Session::new(), "/search graph learning", &CancellationToken::new())
        .await
        .unwrap();
    let TurnReply::Ingested(stats) = reply else {
        panic!("expected ingestion");
    };
    assert_eq!(stats.queries, vec!["temporal memory", "attention", "temporal graph attention"]);
    assert_eq!(stats.papers_found, 2);
    assert_eq!(stats.duplicate_papers, 2);
    assert_eq!(stats.papers_ingested, 2);
    assert!(llm.last_prompt().contains("\"graph learning\""));
    assert_eq!(store.paper_ids().await.unwrap(), vec!["1710.10903", "2006.10637"]);
}

#[tokio::test]
async fn analysis_cites_ingested_papers() {
    let store = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlm::replying(&[
        r#"{"queries": ["graph neural networks", "graph attention"]}"#,
        r#"{"queries": ["temporal graph networks", "dynamic gnn survey"]}"#,
        "## Memory\nTGN keeps per-node memory [P1], see also [W1].",
    ]);
    let web = StaticWeb::default().hit("temporal graph networks", "TGN blog", "https://example.org/tgn");
    let team = build_team(store, llm.clone(), web).await;
    let mut session = Session::new();
    let cancel = CancellationToken::new();

    team.handle_turn(&mut session, "/search graph neural networks", &cancel).await.unwrap();
    let reply = team
        .handle_turn(&mut session, "/analysis How do GNNs handle dynamic graphs?", &cancel)
        .await
        .unwrap();
    let TurnReply::Analysis { outcome, knowledge_base_empty } = reply else {
        panic!("expected analysis");
    };

    assert!(!knowledge_base_empty);
    let passages = &outcome.evidence.passages;
    assert!(!passages.is_empty());
    assert!(passages.len() >= 2);
    assert!(passages[0].score >= passages[1].score);
    assert_eq!(passages[0].section.key.paper_id, "2006.10637");
    assert_eq!(outcome.queries, vec!["temporal graph networks", "dynamic gnn survey"]);
    assert!(outcome.warnings.is_empty());

    assert!(matches!(&outcome.citations[0], Citation::Passage { paper_id, .. } if paper_id == "2006.10637"));
    assert!(matches!(&outcome.citations[1], Citation::Web { url, .. } if url == "https://example.org/tgn"));
    assert!(llm.last_prompt().contains("[P1] Temporal Graph Networks"));

    let json = serde_json::to_value(TurnResponse::from(outcome)).unwrap();
    assert_eq!(json["type"], "analysis");
    assert_eq!(json["citations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_knowledge_base_answers_from_the_web() {
    let llm = ScriptedLlm::replying(&[r#"{"queries": ["dynamic gnn"]}"#, "From the web [W1]."]);
    let web = StaticWeb::default().hit("dynamic gnn", "DGNN", "https://example.org/dgnn");
    let team = build_team(Arc::new(InMemoryStore::new()), llm.clone(), web).await;
    let mut session = Session::with_mode(Mode::Analysis);

    let reply = team
        .handle_turn(&mut session, "How do GNNs handle dynamic graphs?", &CancellationToken::new())
        .await
        .unwrap();
    let TurnReply::Analysis { outcome, knowledge_base_empty } = reply else {
        panic!("expected analysis");
    };
    assert!(knowledge_base_empty);
    assert!(outcome.evidence.passages.is_empty());
    assert_eq!(outcome.evidence.web_results.len(), 1);
    assert!(!outcome.answer.is_empty());
    assert!(outcome.warnings.contains(&EvidenceWarning::NoLocalEvidence));
    assert!(llm.last_prompt().contains("No relevant passages"));
}

#[tokio::test]
async fn web_outage_answers_from_local_papers() {
    let store = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlm::replying(&[
        r#"{"queries": ["dynamic graphs"]}"#,
        r#"{"queries": ["a", "b", "c"]}"#,
        "Local only [P1].",
    ]);
    let team = build_team(store, llm, StaticWeb::down()).await;
    let mut session = Session::new();
    let cancel = CancellationToken::new();

    team.handle_turn(&mut session, "/search dynamic graphs", &cancel).await.unwrap();
    let reply = team
        .handle_turn(&mut session, "/analysis How do GNNs handle dynamic graphs?", &cancel)
        .await
        .unwrap();
    let TurnReply::Analysis { outcome, .. } = reply else {
        panic!("expected analysis");
    };
    assert_eq!(outcome.answer, "Local only [P1].");
    assert!(outcome.evidence.web_results.is_empty());
    assert!(outcome.warnings.contains(&EvidenceWarning::WebUnavailable));
}

#[tokio::test]
async fn no_evidence_and_empty_model_output_fails_synthesis() {
    let llm = ScriptedLlm::replying(&[r#"{"queries": ["x"]}"#, "", "  "]);
    let team = build_team(Arc::new(InMemoryStore::new()), llm, StaticWeb::default()).await;
    let mut session = Session::new();

    let err = team
        .handle_turn(&mut session, "/analysis anything?", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Analysis(OrchestratorError::SynthesisFailed(_))));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn sqlite_knowledge_base_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("kb").join("knowledge.db");

    {
        let store = Arc::new(SqliteStorage::open(&db_path).unwrap());
        let team = build_team(store, ScriptedLlm::default(), StaticWeb::default()).await;
        team.handle_turn(&mut Session::new(), "/search graph neural networks", &CancellationToken::new())
            .await
            .unwrap();
    }

    let store = Arc::new(SqliteStorage::open(&db_path).unwrap());
    let config = store.get_config().await.unwrap().unwrap();
    assert_eq!(config.model_name, "keywords");
    assert_eq!(config.metric, SimilarityMetric::Cosine);

    let engine = RetrievalEngine::new(Arc::new(KeywordEmbedding), store);
    let passages = engine.retrieve("temporal memory of dynamic graphs", 2, None).await.unwrap();
    assert_eq!(passages.len(), 2);
    assert_eq!(passages[0].section.key.paper_id, "2006.10637");
    assert_eq!(passages[0].rank, 1);
}
