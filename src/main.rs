//! `synapse` — CLI front-end for the Synapse Core library.
//!
//! Thin wiring over [`synapse_core`]: load config, build the configured
//! providers, run one operation, print a result. No business logic lives
//! here — see the library crate for that.

use std::io::Read as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use synapse_core::config::{self, Config};
use synapse_core::models::DocumentRecord;
use synapse_core::{db, dedup, embedding, get, ingest, llm, migrate, query, rerank, scheduler, stats};

#[derive(Parser)]
#[command(
    name = "synapse",
    about = "Synapse Core — multi-tenant knowledge-ingestion and hybrid-retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/synapse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest one or more document records (JSON, array or single object)
    /// read from a file, or from stdin if no file is given
    Ingest {
        /// Path to a JSON file of document record(s); reads stdin if absent
        file: Option<PathBuf>,
    },

    /// Answer a question against the hybrid query engine
    Query {
        /// The question to ask
        question: String,

        /// Tenant to scope retrieval to
        #[arg(long)]
        tenant: String,
    },

    /// Answer a question with conversation history (JSON array of
    /// `{role, content}` turns read from a file)
    Chat {
        /// The new message
        message: String,

        /// Tenant to scope retrieval to
        #[arg(long)]
        tenant: String,

        /// Path to a JSON file holding prior conversation turns
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Retrieve a document by id
    Get {
        /// Document ID
        id: String,
    },

    /// Database/store statistics
    Stats,

    /// Entity deduplication engine
    Dedup {
        #[command(subcommand)]
        action: DedupAction,
    },

    /// Scheduler and worker substrate
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand)]
enum DedupAction {
    /// Run the dedup engine once
    Run {
        /// Compute the merge plan but roll back every change
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Run worker iterations until the job queue is empty
    Worker,
    /// Run a single scheduler tick (acquire lock, enqueue dedup if due)
    Tick,
    /// Enqueue backfill jobs for documents with no graph coverage
    Backfill {
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn read_document_records(file: Option<PathBuf>) -> anyhow::Result<Vec<DocumentRecord>> {
    let content = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let value: serde_json::Value = serde_json::from_str(&content)?;
    let records = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(records)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            run_ingest(&cfg, file).await?;
        }
        Commands::Query { question, tenant } => {
            run_query(&cfg, &tenant, &question).await?;
        }
        Commands::Chat { message, tenant, history } => {
            run_chat(&cfg, &tenant, &message, history).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Dedup { action } => match action {
            DedupAction::Run { dry_run } => {
                run_dedup_cmd(&cfg, dry_run).await?;
            }
        },
        Commands::Scheduler { action } => match action {
            SchedulerAction::Worker => run_worker(&cfg).await?,
            SchedulerAction::Tick => run_scheduler_tick(&cfg).await?,
            SchedulerAction::Backfill { limit } => run_backfill_cmd(&cfg, limit).await?,
        },
    }

    Ok(())
}

async fn run_ingest(cfg: &Config, file: Option<PathBuf>) -> anyhow::Result<()> {
    let records = read_document_records(file)?;
    let pool = db::connect(cfg).await?;
    migrate::run_migrations_on(&pool).await?;

    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_extraction_provider(&cfg.llm)?;

    let results = ingest::ingest_batch(&pool, cfg, embedding_provider.as_ref(), llm_provider.as_ref(), records).await;

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }

    pool.close().await;
    Ok(())
}

async fn run_query(cfg: &Config, tenant: &str, question: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_query_provider(&cfg.llm)?;
    let reranker = rerank::create_reranker(&cfg.rerank);

    let response = query::query(
        &pool,
        cfg,
        embedding_provider.as_ref(),
        llm_provider.as_ref(),
        reranker.as_ref(),
        tenant,
        question,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    pool.close().await;
    Ok(())
}

async fn run_chat(cfg: &Config, tenant: &str, message: &str, history_path: Option<PathBuf>) -> anyhow::Result<()> {
    let history: Vec<query::ChatTurn> = match history_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    let pool = db::connect(cfg).await?;
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_query_provider(&cfg.llm)?;
    let reranker = rerank::create_reranker(&cfg.rerank);

    let response = query::chat(
        &pool,
        cfg,
        embedding_provider.as_ref(),
        llm_provider.as_ref(),
        reranker.as_ref(),
        tenant,
        &history,
        message,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    pool.close().await;
    Ok(())
}

async fn run_dedup_cmd(cfg: &Config, dry_run: bool) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;

    let outcome = dedup::run_dedup(&pool, embedding_provider.as_ref(), &cfg.embedding, &cfg.dedup, dry_run).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    pool.close().await;
    Ok(())
}

async fn run_worker(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let embedding_provider = embedding::create_provider(&cfg.embedding)?;
    let llm_provider = llm::create_extraction_provider(&cfg.llm)?;

    let mut processed = 0usize;
    while scheduler::run_worker_once(&pool, cfg, embedding_provider.as_ref(), llm_provider.as_ref()).await? {
        processed += 1;
    }
    println!("processed {} job(s)", processed);

    pool.close().await;
    Ok(())
}

async fn run_scheduler_tick(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let holder = format!("cli-{}", std::process::id());
    let enqueued = scheduler::run_scheduler_tick(&pool, &cfg.scheduler, &holder).await?;
    println!("{}", if enqueued { "dedup job enqueued" } else { "skipped (lock held elsewhere)" });
    pool.close().await;
    Ok(())
}

async fn run_backfill_cmd(cfg: &Config, limit: Option<usize>) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let limit = limit.unwrap_or(cfg.scheduler.backfill_default_limit);
    let count = scheduler::run_backfill(&pool, &cfg.scheduler, limit).await?;
    println!("enqueued {} backfill job(s)", count);
    pool.close().await;
    Ok(())
}

