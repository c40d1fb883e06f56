//! Ingestion pipeline binary entry point.
//!
//! This binary builds the knowledge base for a research topic outside of an
//! interactive session: it finds matching papers in the paper library,
//! filters and embeds their sections, and stores them in the SQLite file.
//!
//! # Examples
//!
//! Initialize a new knowledge base:
//! ```bash
//! ingestion --mode init-new --topic "graph neural networks"
//! ```
//!
//! Add a topic to an existing knowledge base:
//! ```bash
//! ingestion --topic "temporal graphs" --papers-dir arxiv_data/papers
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use research_team::{
    config::ResearchConfig,
    embedding,
    ingestion::{IngestionPipeline, PaperSources},
    models::SimilarityMetric,
    provider::json::JsonPaperLibrary,
    storage::sqlite::SqliteStorage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Operation mode for the ingestion pipeline
#[derive(Debug, Clone, ValueEnum)]
enum Mode {
    /// Connect to an existing knowledge base, creating it when missing (default)
    Connect,
    /// Initialize a new knowledge base, replacing its embedding configuration
    InitNew,
}

/// Ingestion pipeline CLI for building the research knowledge base
#[derive(Parser, Debug)]
#[command(
    name = "ingestion",
    version,
    about = "Build and update the research knowledge base",
    long_about = "Ingestion pipeline that finds papers on a topic, extracts and filters their sections, \
                  generates embeddings, and stores them in the knowledge base.

EXAMPLES:
  Initialize a new knowledge base:
    ingestion --mode init-new --topic \"graph neural networks\"

  Add a topic using a custom paper library:
    ingestion --topic \"temporal graphs\" --papers-dir arxiv_data/papers

  Start over:
    ingestion --reset --topic \"graph neural networks\"

  Custom batch size and logging:
    ingestion --topic \"transformers\" --batch-size 8 --log-level debug"
)]
struct IngestionArgs {
    /// Research topic to ingest papers for
    #[arg(short, long, value_name = "TEXT")]
    topic: String,

    /// TOML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory of paper JSON files
    #[arg(long, value_name = "DIR")]
    papers_dir: Option<PathBuf>,

    /// Knowledge base file path
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Operation mode: connect to existing DB or initialize new DB
    #[arg(long, value_enum, default_value = "connect")]
    mode: Mode,

    /// Similarity metric recorded for a new knowledge base
    #[arg(long, value_name = "METRIC")]
    metric: Option<SimilarityMetric>,

    /// Number of sections per embedding request
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Maximum papers taken for the topic (0 for no cap)
    #[arg(long, value_name = "N")]
    max_papers: Option<usize>,

    /// Delete every stored section before ingesting
    #[arg(long)]
    reset: bool,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load the configuration file and apply command line overrides
fn load_config(args: &IngestionArgs) -> Result<ResearchConfig> {
    let mut config = ResearchConfig::load_or_default(args.config.as_deref())
        .with_context(|| "Failed to load configuration")?;

    if let Some(dir) = &args.papers_dir {
        config.ingestion.papers_dir = dir.clone();
    }
    if let Some(db_path) = &args.db_path {
        config.storage.db_path = db_path.clone();
    }
    if let Some(metric) = args.metric {
        config.storage.metric = metric;
    }
    if let Some(batch_size) = args.batch_size {
        config.ingestion.batch_size = batch_size;
    }
    if let Some(max_papers) = args.max_papers {
        config.ingestion.max_papers = max_papers;
    }
    config.validate().with_context(|| "Invalid configuration")?;
    Ok(config)
}

/// Create and initialize the ingestion pipeline based on mode
async fn create_pipeline(args: &IngestionArgs, config: &ResearchConfig) -> Result<IngestionPipeline> {
    let embedding = embedding::from_settings(&config.embedding).context("Failed to create embedding provider")?;
    info!(
        "Embedding provider initialized: model={}, dimension={}",
        embedding.model_name(),
        embedding.dimension()
    );

    debug!("Opening SQLite storage at: {}", config.storage.db_path.display());
    let storage = Arc::new(SqliteStorage::open(&config.storage.db_path).context("Failed to create storage")?);

    let library = JsonPaperLibrary::open(&config.ingestion.papers_dir)
        .await
        .with_context(|| format!("Failed to load papers from {}", config.ingestion.papers_dir.display()))?;
    info!("Loaded {} papers from {}", library.len(), config.ingestion.papers_dir.display());
    if library.is_empty() {
        warn!("The paper library is empty; nothing can be ingested");
    }
    let sources = PaperSources::from_shared(Arc::new(library));

    let pipeline = match args.mode {
        Mode::Connect => {
            info!("Connecting to knowledge base with config validation");
            IngestionPipeline::open(
                embedding,
                storage,
                sources,
                config.ingestion.clone(),
                config.storage.metric,
            )
            .await
            .context("Failed to connect to the knowledge base. Use --mode init-new to start a new one.")?
        }
        Mode::InitNew => {
            info!("Initializing new knowledge base");
            IngestionPipeline::initialize_new(
                embedding,
                storage,
                sources,
                config.ingestion.clone(),
                config.storage.metric,
            )
            .await
            .context("Failed to initialize new knowledge base")?
        }
    };

    debug!("Pipeline created with batch_size={}", config.ingestion.batch_size);
    Ok(pipeline)
}

/// Create a spinner shown while the topic is ingested
fn create_spinner(topic: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner:.cyan} {msg}")
            .expect("Invalid progress bar template"),
    );
    pb.set_message(format!("Ingesting papers on \"{topic}\"..."));
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = IngestionArgs::parse();

    // Initialize logging
    init_logging(&args.log_level).context("Failed to initialize logging")?;

    info!("Starting knowledge base ingestion");
    debug!("CLI arguments: {:?}", args);

    let start_time = Instant::now();

    if args.topic.trim().is_empty() {
        anyhow::bail!("The topic must not be empty.");
    }

    let config = load_config(&args)?;
    if !config.ingestion.papers_dir.exists() {
        error!("Paper library does not exist: {:?}", config.ingestion.papers_dir);
        anyhow::bail!("Paper library not found: {:?}", config.ingestion.papers_dir);
    }
    info!("Knowledge base: {}", config.storage.db_path.display());

    let pipeline = create_pipeline(&args, &config)
        .await
        .context("Failed to create ingestion pipeline")?;

    if args.reset {
        pipeline.reset().await.context("Failed to reset the knowledge base")?;
        info!("Knowledge base cleared");
    }

    let progress = create_spinner(&args.topic);
    let stats = pipeline.ingest(&args.topic).await;
    progress.finish_and_clear();
    let stats = stats.context("Failed to ingest papers")?;

    let total = pipeline
        .storage()
        .count_sections()
        .await
        .context("Failed to count stored sections")?;

    // Display final statistics
    let elapsed = start_time.elapsed();
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Ingestion Completed               ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Papers found:         {:>16} ║", stats.papers_found);
    println!("║ Papers ingested:      {:>16} ║", stats.papers_ingested);
    println!("║ Papers skipped:       {:>16} ║", stats.papers_skipped);
    println!("║ Sections stored:      {:>16} ║", stats.sections_stored);
    println!("║   of which new:       {:>16} ║", stats.sections_inserted());
    println!("║ Sections filtered:    {:>16} ║", stats.sections_filtered);
    println!("║ Sections failed:      {:>16} ║", stats.sections_failed);
    println!("║ Knowledge base total: {:>16} ║", total);
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    if !stats.warnings.is_empty() {
        warn!(
            "{} items were skipped - check logs for details",
            stats.warnings.len()
        );
    }

    info!("Ingestion pipeline completed successfully");

    Ok(())
}
