//! Research assistant binary entry point.
//!
//! Interactive research session over the local knowledge base and the web.
//! Every message is dispatched by mode: plain chat, `/search <topic>` to
//! build the knowledge base, or `/analysis <question>` to run the
//! Librarian, Web Researcher and Lead Analyst.
//!
//! # Examples
//!
//! Interactive session with the default local setup:
//! ```bash
//! research
//! ```
//!
//! One analysis printed as JSON:
//! ```bash
//! research --message "/analysis How do GNNs handle dynamic graphs?" --format json
//! ```
//!
//! Custom configuration file:
//! ```bash
//! research --config research.toml --llm-model llama3:8b
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use research_team::{
    config::ResearchConfig,
    embedding,
    frontend::{evidence_sources, IngestionSummaryDto, PassageDto, TurnResponse, WebSourceDto},
    ingestion::{IngestionPipeline, PaperSources},
    llm::{ollama::OllamaChat, LlmClient},
    models::{Mode, Role},
    orchestrator::{Citation, Orchestrator, PhaseEvent},
    provider::json::JsonPaperLibrary,
    retrieval::RetrievalEngine,
    session::{ResearchTeam, Session},
    storage::sqlite::SqliteStorage,
    websearch::{duckduckgo::DuckDuckGoSearch, WebSearchClient},
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for replies
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown answer followed by source tables
    Table,
    /// The reply payload as JSON
    Json,
}

/// Research assistant CLI
#[derive(Parser, Debug)]
#[command(
    name = "research",
    version,
    about = "Multi-agent research assistant over local papers and the web",
    long_about = "Chat with a research team: build a knowledge base of paper sections with /search, \
                  then ask questions with /analysis to get one cited answer from local papers and web results.

EXAMPLES:
  Interactive session:
    research

  Start in analysis mode:
    research --mode analysis

  Single message as JSON:
    research --message \"/analysis How do GNNs handle dynamic graphs?\" --format json

  Custom configuration:
    research --config research.toml --top-k 5"
)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Knowledge base file (overrides the config file)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Directory of paper JSON files used by /search
    #[arg(long, value_name = "DIR")]
    papers_dir: Option<PathBuf>,

    /// Chat model served by Ollama
    #[arg(long, value_name = "MODEL")]
    llm_model: Option<String>,

    /// Passages retrieved per analysis
    #[arg(long, value_name = "N")]
    top_k: Option<usize>,

    /// Mode for messages without a command prefix
    #[arg(long, value_enum, default_value = "chat")]
    mode: ModeArg,

    /// Send one message and exit instead of starting the interactive session
    #[arg(long, short = 'm', value_name = "TEXT")]
    message: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Logging verbosity level
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Chat,
    Search,
    Analysis,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Chat => Mode::Chat,
            ModeArg::Search => Mode::Search,
            ModeArg::Analysis => Mode::Analysis,
        }
    }
}

/// Setup logging with the specified level
fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

/// Load the configuration file and apply command line overrides
fn load_config(args: &Args) -> Result<ResearchConfig> {
    let mut config = ResearchConfig::load_or_default(args.config.as_deref())
        .with_context(|| "Failed to load configuration")?;

    if let Some(db_path) = &args.db_path {
        config.storage.db_path = db_path.clone();
    }
    if let Some(papers_dir) = &args.papers_dir {
        config.ingestion.papers_dir = papers_dir.clone();
    }
    if let Some(model) = &args.llm_model {
        config.llm.model = model.clone();
    }
    if let Some(top_k) = args.top_k {
        config.orchestrator.top_k = top_k;
    }
    config.validate().with_context(|| "Invalid configuration")?;
    Ok(config)
}

/// Wire the collaborators into a research team
async fn build_team(config: &ResearchConfig, progress: mpsc::UnboundedSender<PhaseEvent>) -> Result<ResearchTeam> {
    let embedding = embedding::from_settings(&config.embedding).with_context(|| "Failed to create embedding provider")?;
    info!(
        "Using embedding model: {} (dimension: {})",
        embedding.model_name(),
        embedding.dimension()
    );

    let storage = Arc::new(
        SqliteStorage::open(&config.storage.db_path)
            .with_context(|| format!("Failed to open knowledge base at {}", config.storage.db_path.display()))?,
    );

    tokio::fs::create_dir_all(&config.ingestion.papers_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.ingestion.papers_dir.display()))?;
    let library = JsonPaperLibrary::open(&config.ingestion.papers_dir)
        .await
        .with_context(|| format!("Failed to load papers from {}", config.ingestion.papers_dir.display()))?;
    info!("Paper library contains {} papers", library.len());

    let ingestion = IngestionPipeline::open(
        embedding.clone(),
        storage.clone(),
        PaperSources::from_shared(Arc::new(library)),
        config.ingestion.clone(),
        config.storage.metric,
    )
    .await
    .with_context(|| "Failed to open the knowledge base. Was it built with a different embedding model?")?;

    let llm: Arc<dyn LlmClient> =
        Arc::new(OllamaChat::new(&config.llm).with_context(|| "Failed to create language model client")?);
    let web: Arc<dyn WebSearchClient> =
        Arc::new(DuckDuckGoSearch::new(&config.web_search).with_context(|| "Failed to create web search client")?);

    let mut orchestrator = Orchestrator::new(
        Arc::new(RetrievalEngine::new(embedding, storage)),
        llm.clone(),
        web.clone(),
        config.orchestrator.clone(),
    );
    orchestrator.set_progress_channel(progress);

    Ok(ResearchTeam::new(ingestion, orchestrator, llm, web, config.session.clone()))
}

/// Print which agent is working while a turn runs
fn spawn_progress_printer(mut rx: mpsc::UnboundedReceiver<PhaseEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PhaseEvent::Entered(phase) => eprintln!("  → {}: {}…", phase.agent(), phase),
                PhaseEvent::PassagesFound(n) => eprintln!("    found {n} local passages"),
                PhaseEvent::QueriesPlanned(queries) => eprintln!("    web queries: {}", queries.join(" | ")),
                PhaseEvent::WebResultsFound(n) => eprintln!("    found {n} web results"),
                PhaseEvent::Warning(warning) => eprintln!("    ⚠ {warning}"),
                PhaseEvent::Completed => {}
            }
        }
    });
}

/// Run one turn, cancelling it on Ctrl-C
async fn run_turn(team: &ResearchTeam, session: &mut Session, line: &str) -> TurnResponse {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let start = Instant::now();
    let result = team.handle_turn(session, line, &cancel).await;
    watcher.abort();
    debug!("Turn finished in {:.2}s", start.elapsed().as_secs_f64());

    TurnResponse::from(result)
}

fn print_response(response: &TurnResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(response).with_context(|| "Failed to serialize reply to JSON")?;
            println!("{json}");
        }
        OutputFormat::Table => match response {
            TurnResponse::Completion { text, sources } => {
                println!("\n{text}\n");
                if !sources.is_empty() {
                    println!("{}", format_web_table(sources));
                }
            }
            TurnResponse::Ingestion(summary) => println!("{}", format_ingestion_table(summary)),
            TurnResponse::Analysis {
                answer,
                citations,
                passages,
                web,
                warnings,
            } => {
                println!("\n{answer}\n");
                for warning in warnings {
                    eprintln!("⚠ {warning}");
                }
                if !citations.is_empty() {
                    println!("{}", format_citations_table(citations));
                }
                debug!("{} passages and {} web results were available", passages.len(), web.len());
            }
            TurnResponse::Error { message, cancelled } => {
                if *cancelled {
                    eprintln!("Cancelled. {message}");
                } else {
                    eprintln!("Error: {message}");
                }
            }
        },
    }
    Ok(())
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|h| Cell::new(h).add_attribute(Attribute::Bold)));
    table
}

fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max.saturating_sub(3)).collect::<String>())
    } else {
        text.to_string()
    }
}

fn format_citations_table(citations: &[Citation]) -> String {
    let mut table = new_table(&["Ref", "Source", "Detail", "URL"]);
    for citation in citations {
        let row = match citation {
            Citation::Passage {
                marker,
                paper_id,
                section_name,
                paper_title,
                url,
            } => vec![
                Cell::new(marker).fg(Color::Cyan),
                Cell::new(shorten(paper_title, 50)),
                Cell::new(format!("{paper_id} · {section_name}")),
                Cell::new(url),
            ],
            Citation::Web { marker, title, url } => vec![
                Cell::new(marker).fg(Color::Yellow),
                Cell::new(shorten(title, 50)),
                Cell::new("web"),
                Cell::new(url),
            ],
        };
        table.add_row(row);
    }
    table.to_string()
}

fn format_passages_table(passages: &[PassageDto]) -> String {
    let mut table = new_table(&["Ref", "Paper", "Section", "Relevance", "Score"]);
    for passage in passages {
        let color = match passage.relevance.as_str() {
            "IDENTICAL" => Color::Green,
            "HIGHLY_SIMILAR" => Color::Cyan,
            "SIMILAR" => Color::Yellow,
            _ => Color::White,
        };
        table.add_row(vec![
            Cell::new(&passage.marker),
            Cell::new(shorten(&passage.paper_title, 50)),
            Cell::new(shorten(&passage.section, 30)),
            Cell::new(&passage.relevance).fg(color),
            Cell::new(format!("{:.4}", passage.score)),
        ]);
    }
    table.to_string()
}

fn format_web_table(results: &[WebSourceDto]) -> String {
    let mut table = new_table(&["Ref", "Title", "Query", "URL"]);
    for result in results {
        table.add_row(vec![
            Cell::new(&result.marker),
            Cell::new(shorten(&result.title, 50)),
            Cell::new(shorten(&result.query, 30)),
            Cell::new(&result.url),
        ]);
    }
    table.to_string()
}

fn format_ingestion_table(summary: &IngestionSummaryDto) -> String {
    let mut table = new_table(&["Topic", summary.topic.as_str()]);
    table.add_row(vec![Cell::new("Queries"), Cell::new(summary.queries.join("\n"))]);
    for (label, value) in [
        ("Papers found", summary.papers_found),
        ("Papers ingested", summary.papers_ingested),
        ("Papers skipped", summary.papers_skipped),
        ("Sections stored", summary.sections_stored),
        ("New sections", summary.sections_new),
        ("Sections filtered", summary.sections_filtered),
        ("Sections failed", summary.sections_failed),
    ] {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    let mut out = table.to_string();
    for warning in &summary.warnings {
        out.push_str(&format!("\n⚠ {warning}"));
    }
    out
}

fn print_help() {
    println!("Commands:");
    println!("  <message>            - Send a message in the current mode");
    println!("  /search <topic>      - Add papers on a topic to the knowledge base");
    println!("  /analysis <question> - Answer from local papers and the web");
    println!("  /mode [chat|search|analysis] - Show or set the default mode");
    println!("  /history             - Show the conversation so far");
    println!("  /sources             - Show the evidence behind the last analysis");
    println!("  /reset               - Delete the knowledge base and clear the conversation");
    println!("  /help                - Show this help");
    println!("  Ctrl+C during a turn cancels it; Ctrl+D or Ctrl+C at the prompt exits");
}

/// Run interactive REPL mode
async fn run_interactive(team: ResearchTeam, mut session: Session, format: OutputFormat) -> Result<()> {
    println!("Research Team");
    match team.section_count().await {
        Ok(0) => println!("The knowledge base is empty. Start with /search <topic>."),
        Ok(n) => println!("Knowledge base: {n} sections."),
        Err(e) => eprintln!("Could not read the knowledge base: {e}"),
    }
    print_help();
    println!();

    let mut rl = DefaultEditor::new().with_context(|| "Failed to create readline editor")?;

    loop {
        let prompt = format!("{}> ", session.mode());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line).ok();

                let command = line.split_whitespace().next().unwrap_or_default().to_lowercase();
                match command.as_str() {
                    "/help" => print_help(),
                    "/mode" => match line.split_whitespace().nth(1) {
                        None => println!("Current mode: {}", session.mode()),
                        Some(raw) => match raw.parse::<Mode>() {
                            Ok(mode) => {
                                session.set_mode(mode);
                                println!("Set mode to {mode}");
                            }
                            Err(e) => eprintln!("{e}"),
                        },
                    },
                    "/history" => {
                        if session.history().is_empty() {
                            println!("No messages yet.");
                        }
                        for turn in session.history() {
                            let who = match turn.role {
                                Role::User => "you",
                                Role::Assistant => "team",
                            };
                            println!("[{}] {who}: {}", turn.mode, shorten(&turn.content, 120));
                        }
                    }
                    "/sources" => match session.last_evidence() {
                        None => println!("No analysis yet."),
                        Some(evidence) => {
                            let (passages, web) = evidence_sources(evidence);
                            println!("Question: {}", evidence.question);
                            if passages.is_empty() {
                                println!("No local passages.");
                            } else {
                                println!("{}", format_passages_table(&passages));
                            }
                            if web.is_empty() {
                                println!("No web results.");
                            } else {
                                println!("{}", format_web_table(&web));
                            }
                        }
                    },
                    "/reset" => match team.reset_knowledge_base().await {
                        Ok(()) => {
                            session.clear();
                            println!("Knowledge base and conversation cleared.");
                        }
                        Err(e) => eprintln!("Reset failed: {e}"),
                    },
                    _ => {
                        let response = run_turn(&team, &mut session, line).await;
                        print_response(&response, format)?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level);

    let config = load_config(&args)?;
    info!("Knowledge base: {}", config.storage.db_path.display());

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let team = build_team(&config, progress_tx).await?;
    if matches!(args.format, OutputFormat::Table) {
        spawn_progress_printer(progress_rx);
    }

    let session = Session::with_mode(args.mode.into());

    match args.message.as_deref() {
        Some(message) => {
            let mut session = session;
            let response = run_turn(&team, &mut session, message).await;
            print_response(&response, args.format)?;
            if let TurnResponse::Error { message, .. } = response {
                anyhow::bail!(message);
            }
        }
        None => run_interactive(team, session, args.format).await?,
    }

    Ok(())
}
