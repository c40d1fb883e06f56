//! Research Team - a multi-agent research assistant over academic papers.
//!
//! The library answers research questions by combining a local knowledge
//! base of paper sections with live web search. Three agents run in order
//! for every analysis: a Librarian searching the knowledge base, a Web
//! Researcher turning the findings into web queries, and a Lead Analyst
//! writing one cited Markdown answer.
//!
//! # Architecture
//!
//! The system is organized into several key modules:
//!
//! - **models**: Core data structures (PaperSection, EvidenceBundle, ConversationTurn, etc.)
//! - **embedding**: Text embedding generation and normalization
//! - **llm**: Chat completions, including JSON replies parsed into types
//! - **websearch**: Keyword web search
//! - **storage**: The section store (SQLite file or in memory)
//! - **provider**: Paper discovery and section extraction collaborators
//! - **ingestion**: Building the knowledge base for a topic
//! - **retrieval**: Nearest-section search for a question
//! - **orchestrator**: The Librarian, Web Researcher and Lead Analyst pipeline
//! - **session**: Conversation history and per-turn dispatch
//! - **frontend**: Request/response payloads for whatever renders the chat
//!
//! # Workflow
//!
//! ## Building the knowledge base (`/search <topic>`)
//!
//! 1. Discover papers for the topic
//! 2. Extract their sections and drop boilerplate or broken ones
//! 3. Embed each section together with its provenance
//! 4. Upsert sections into the store, keyed by paper id and section name
//!
//! ## Answering a question (`/analysis <question>`)
//!
//! 1. Retrieve the nearest sections from the store
//! 2. Ask the language model for follow-up web queries
//! 3. Run the queries concurrently
//! 4. Ask the language model for an answer citing `[P#]` and `[W#]` markers
//!
//! # Example
//!
//! ```ignore
//! use research_team::{
//!     session::{ResearchTeam, Session},
//!     frontend::TurnResponse,
//! };
//!
//! let mut session = Session::new();
//! let reply = team
//!     .handle_turn(&mut session, "/analysis How do GNNs handle dynamic graphs?", &cancel)
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&TurnResponse::from(reply))?);
//! ```

// Public modules
pub mod config;
pub mod embedding;
pub mod frontend;
pub mod ingestion;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod retrieval;
pub mod session;
pub mod storage;
pub mod websearch;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use config::ResearchConfig;
pub use embedding::EmbeddingProvider;
pub use frontend::{TurnRequest, TurnResponse};
pub use ingestion::{IngestionPipeline, IngestionStats};
pub use llm::LlmClient;
pub use models::{
    ConversationTurn, EmbeddingConfig, EvidenceBundle, Mode, PaperSection, RelevanceLevel, RetrievedPassage,
    SimilarityMetric, WebResult,
};
pub use orchestrator::{AnalysisOutcome, Orchestrator, OrchestratorError, Phase};
pub use retrieval::{RetrievalEngine, Retriever};
pub use session::{ResearchTeam, Session, SessionError, TurnReply};
pub use storage::{SectionFilter, SectionStore, YearRange};
pub use websearch::WebSearchClient;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
