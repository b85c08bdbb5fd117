//! Configuration parsing and validation.
//!
//! The core is configured via a TOML file (default: `config/synapse.toml`).
//! The config defines the store path, chunking parameters, embedding/LLM/
//! rerank provider settings, ingestion concurrency bounds, dedup cadence and
//! thresholds, retrieval tuning, and scheduler cadence — the full surface
//! from §6.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub target_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    200
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: i64,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: i64,
    #[serde(default = "default_true")]
    pub enable_rerank: bool,
    #[serde(default = "default_decay_email")]
    pub recency_decay_days_email: f64,
    #[serde(default = "default_decay_attachment")]
    pub recency_decay_days_attachment: f64,
    #[serde(default = "default_decay_default")]
    pub recency_decay_days_default: f64,
    #[serde(default = "default_chat_history_tokens")]
    pub chat_history_token_budget: usize,
}

fn default_similarity_top_k() -> i64 {
    20
}
fn default_rerank_top_n() -> i64 {
    10
}
fn default_decay_email() -> f64 {
    30.0
}
fn default_decay_attachment() -> f64 {
    90.0
}
fn default_decay_default() -> f64 {
    60.0
}
fn default_chat_history_tokens() -> usize {
    3_900
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: default_similarity_top_k(),
            rerank_top_n: default_rerank_top_n(),
            enable_rerank: true,
            recency_decay_days_email: default_decay_email(),
            recency_decay_days_attachment: default_decay_attachment(),
            recency_decay_days_default: default_decay_default(),
            chat_history_token_budget: default_chat_history_tokens(),
        }
    }
}

impl RetrievalConfig {
    /// Document-type-aware recency decay (§4.6 step 4).
    pub fn decay_days_for(&self, document_type: &str) -> f64 {
        match document_type {
            "email" => self.recency_decay_days_email,
            "attachment" | "file" => self.recency_decay_days_attachment,
            _ => self.recency_decay_days_default,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 3,
            timeout_secs: 60,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Chat-completion LLM used by the extractor, validator, time-extractor,
/// and synthesiser.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub extraction_model: Option<String>,
    #[serde(default)]
    pub query_model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            extraction_model: None,
            query_model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_rerank_provider() -> String {
    "heuristic".to_string()
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_max_concurrent_graph")]
    pub max_concurrent_graph: usize,
    #[serde(default = "default_graph_pool_size")]
    pub graph_pool_size: usize,
}

fn default_num_workers() -> usize {
    4
}
fn default_max_concurrent_graph() -> usize {
    10
}
fn default_graph_pool_size() -> usize {
    50
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_concurrent_graph: default_max_concurrent_graph(),
            graph_pool_size: default_graph_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_max_triplets")]
    pub max_triplets_per_chunk: usize,
    #[serde(default = "default_true")]
    pub enable_relationship_validation: bool,
    #[serde(default = "default_extractor_context_budget")]
    pub context_budget_chars: usize,
    #[serde(default = "default_validator_prefix")]
    pub validator_prefix_chars: usize,
}

fn default_max_triplets() -> usize {
    5
}
fn default_extractor_context_budget() -> usize {
    24_000
}
fn default_validator_prefix() -> usize {
    500
}
fn default_true() -> bool {
    true
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_triplets_per_chunk: default_max_triplets(),
            enable_relationship_validation: true,
            context_budget_chars: default_extractor_context_budget(),
            validator_prefix_chars: default_validator_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dedup_interval")]
    pub interval_minutes: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_string_distance")]
    pub max_string_distance: usize,
    #[serde(default = "default_hours_lookback")]
    pub hours_lookback: Option<i64>,
    #[serde(default = "default_dedup_top_k")]
    pub top_k: i64,
    #[serde(default = "default_merge_guard")]
    pub merge_guard_threshold: usize,
    #[serde(default = "default_dedup_batch_size")]
    pub batch_size: usize,
}

fn default_dedup_interval() -> u64 {
    15
}
fn default_similarity_threshold() -> f32 {
    0.92
}
fn default_max_string_distance() -> usize {
    3
}
fn default_hours_lookback() -> Option<i64> {
    Some(24)
}
fn default_dedup_top_k() -> i64 {
    10
}
fn default_merge_guard() -> usize {
    100
}
fn default_dedup_batch_size() -> usize {
    10
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_dedup_interval(),
            similarity_threshold: default_similarity_threshold(),
            max_string_distance: default_max_string_distance(),
            hours_lookback: default_hours_lookback(),
            top_k: default_dedup_top_k(),
            merge_guard_threshold: default_merge_guard(),
            batch_size: default_dedup_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_refresh")]
    pub lock_refresh_secs: u64,
    #[serde(default = "default_job_deadline")]
    pub job_deadline_secs: u64,
    #[serde(default = "default_job_max_retries")]
    pub job_max_retries: u32,
    #[serde(default = "default_backfill_limit")]
    pub backfill_default_limit: usize,
    #[serde(default = "default_backfill_max")]
    pub backfill_max_limit: usize,
}

fn default_lock_ttl() -> u64 {
    60
}
fn default_lock_refresh() -> u64 {
    30
}
fn default_job_deadline() -> u64 {
    3_600
}
fn default_job_max_retries() -> u32 {
    3
}
fn default_backfill_limit() -> usize {
    100
}
fn default_backfill_max() -> usize {
    1_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            lock_refresh_secs: default_lock_refresh(),
            job_deadline_secs: default_job_deadline(),
            job_max_retries: default_job_max_retries(),
            backfill_default_limit: default_backfill_limit(),
            backfill_max_limit: default_backfill_max(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_size == 0 {
        anyhow::bail!("chunking.target_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.target_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.target_size");
    }
    if config.retrieval.similarity_top_k < 1 {
        anyhow::bail!("retrieval.similarity_top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.dedup.similarity_threshold) {
        anyhow::bail!("dedup.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.ingestion.max_concurrent_graph >= config.ingestion.graph_pool_size {
        anyhow::bail!(
            "ingestion.max_concurrent_graph ({}) must be less than ingestion.graph_pool_size ({})",
            config.ingestion.max_concurrent_graph,
            config.ingestion.graph_pool_size
        );
    }
    if config.scheduler.backfill_default_limit > config.scheduler.backfill_max_limit {
        anyhow::bail!("scheduler.backfill_default_limit must be <= backfill_max_limit");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be disabled or openai.", other),
    }
    if config.embedding.is_enabled()
        && (config.embedding.dims.is_none() || config.embedding.dims == Some(0))
    {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }

    Ok(())
}
