//! Scheduler and worker substrate (§4.7).
//!
//! A durable FIFO job queue with at-least-once delivery and per-job retry
//! counters, a SQLite-backed distributed lock emulating atomic
//! `SET key value IF NOT EXISTS WITH TTL` (§6), a periodic scheduler that
//! only runs dedup while holding that lock, and an operator-facing
//! backfill task. Grounded on the teacher's transaction idioms in
//! `migrate.rs`/`ingest.rs`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, SchedulerConfig};
use crate::dedup;
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;
use crate::{docstore, graph, ingest};

/// Enqueues a job, returning its id. `job_type` distinguishes dedup runs
/// from backfill tasks from future job kinds.
pub async fn enqueue(
    pool: &SqlitePool,
    job_type: &str,
    payload: &serde_json::Value,
    scheduler_config: &SchedulerConfig,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let deadline = now + scheduler_config.job_deadline_secs as i64;

    sqlx::query(
        r#"
        INSERT INTO jobs (id, job_type, payload_json, status, attempts, max_retries, enqueued_at, deadline_at)
        VALUES (?, ?, ?, 'queued', 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(job_type)
    .bind(payload.to_string())
    .bind(scheduler_config.job_max_retries as i64)
    .bind(now)
    .bind(deadline)
    .execute(pool)
    .await?;

    Ok(id)
}

struct ClaimedJob {
    id: String,
    job_type: String,
    payload: serde_json::Value,
    attempts: i64,
    max_retries: i64,
    deadline_at: i64,
}

/// Atomically claims the oldest queued job whose deadline has not yet
/// passed (§4.7: workers pull jobs, mark `running`).
async fn claim_next(pool: &SqlitePool) -> Result<Option<ClaimedJob>> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        "SELECT id, job_type, payload_json, attempts, max_retries, deadline_at FROM jobs WHERE status = 'queued' ORDER BY enqueued_at ASC LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let id: String = row.get("id");
    let now = chrono::Utc::now().timestamp();

    sqlx::query("UPDATE jobs SET status = 'running', started_at = ? WHERE id = ?")
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let payload_json: String = row.get("payload_json");
    Ok(Some(ClaimedJob {
        id,
        job_type: row.get("job_type"),
        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
        attempts: row.get("attempts"),
        max_retries: row.get("max_retries"),
        deadline_at: row.get("deadline_at"),
    }))
}

async fn mark_completed(pool: &SqlitePool, job_id: &str, result: &serde_json::Value) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE jobs SET status = 'completed', completed_at = ?, result_json = ? WHERE id = ?",
    )
    .bind(now)
    .bind(result.to_string())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks a job failed, or re-queues it (at-least-once redelivery) if
/// attempts remain (§4.7 retry counter, max 3).
async fn mark_failed_or_retry(pool: &SqlitePool, job: &ClaimedJob, error: &str) -> Result<()> {
    let attempts = job.attempts + 1;
    if attempts >= job.max_retries {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(&job.id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query("UPDATE jobs SET status = 'queued', attempts = ?, error = ?, started_at = NULL WHERE id = ?")
            .bind(attempts)
            .bind(error)
            .bind(&job.id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Executes a single dequeued job, enforcing the job's wall-clock
/// deadline (§4.7/§5 `DeadlineExceeded`).
async fn execute_job(
    pool: &SqlitePool,
    job: &ClaimedJob,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
) -> Result<serde_json::Value> {
    let now = chrono::Utc::now().timestamp();
    let remaining = (job.deadline_at - now).max(0) as u64;

    let work = async {
        match job.job_type.as_str() {
            "dedup" => {
                let outcome = dedup::run_dedup(pool, embedding_provider, &config.embedding, &config.dedup, false).await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(outcome)?)
            }
            "backfill" => {
                let document_id = job
                    .payload
                    .get("document_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let result = run_backfill_job(pool, config, embedding_provider, llm_provider, document_id).await?;
                Ok(serde_json::to_value(result)?)
            }
            other => anyhow::bail!("unknown job type: {}", other),
        }
    };

    match tokio::time::timeout(std::time::Duration::from_secs(remaining.max(1)), work).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "job exceeded its deadline after {}s",
            config.scheduler.job_deadline_secs
        )),
    }
}

/// Re-derives a single document's chunks/vectors and graph nodes by
/// re-running the ingestion pipeline against its stored record (§4.7
/// backfill: "lacking a derived artifact"). Idempotent, the same as any
/// other re-ingestion (invariant 6).
async fn run_backfill_job(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    document_id: &str,
) -> Result<crate::models::IngestResult> {
    let Some(record) = docstore::get_as_record(pool, document_id).await? else {
        anyhow::bail!("backfill target {} no longer exists", document_id);
    };

    let relation_schema = graph::relation_schema(pool).await.unwrap_or_default();
    let graph_semaphore = Semaphore::new(config.ingestion.max_concurrent_graph.max(1));

    Ok(ingest::ingest_document(
        pool,
        config,
        embedding_provider,
        llm_provider,
        &graph_semaphore,
        &relation_schema,
        &record,
    )
    .await)
}

/// Runs one worker iteration: claim a job if one is queued, execute it,
/// and mark the outcome. Returns `true` if a job was processed.
pub async fn run_worker_once(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
) -> Result<bool> {
    let Some(job) = claim_next(pool).await? else {
        return Ok(false);
    };

    match execute_job(pool, &job, config, embedding_provider, llm_provider).await {
        Ok(result) => {
            mark_completed(pool, &job.id, &result).await?;
            info!(job_id = %job.id, job_type = %job.job_type, "job completed");
        }
        Err(e) => {
            mark_failed_or_retry(pool, &job, &e.to_string()).await?;
            warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "job failed");
        }
    }

    Ok(true)
}

/// Attempts to acquire the distributed scheduler lock, emulating atomic
/// `SET key value IF NOT EXISTS WITH TTL` over a plain table: the insert
/// only succeeds if no unexpired row exists (§4.7, §6).
pub async fn try_acquire_lock(pool: &SqlitePool, lock_key: &str, holder: &str, ttl_secs: u64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let expires_at = now + ttl_secs as i64;

    let mut tx = pool.begin().await?;
    let existing: Option<i64> = sqlx::query_scalar("SELECT expires_at FROM distributed_locks WHERE lock_key = ?")
        .bind(lock_key)
        .fetch_optional(&mut *tx)
        .await?;

    let acquired = match existing {
        Some(exp) if exp > now => false,
        _ => {
            sqlx::query(
                "INSERT INTO distributed_locks (lock_key, holder, expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT(lock_key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            )
            .bind(lock_key)
            .bind(holder)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
            true
        }
    };

    tx.commit().await?;
    Ok(acquired)
}

/// Refreshes the lock's TTL; only succeeds while `holder` still owns it.
pub async fn refresh_lock(pool: &SqlitePool, lock_key: &str, holder: &str, ttl_secs: u64) -> Result<bool> {
    let expires_at = chrono::Utc::now().timestamp() + ttl_secs as i64;
    let result = sqlx::query(
        "UPDATE distributed_locks SET expires_at = ? WHERE lock_key = ? AND holder = ?",
    )
    .bind(expires_at)
    .bind(lock_key)
    .bind(holder)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn release_lock(pool: &SqlitePool, lock_key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM distributed_locks WHERE lock_key = ? AND holder = ?")
        .bind(lock_key)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

const DEDUP_LOCK_KEY: &str = "scheduler:dedup";

/// Runs the periodic scheduler's single dedup-enqueue tick: attempts the
/// distributed lock, and on success enqueues a dedup job; on failure to
/// acquire, exits cleanly without enqueueing (§4.7 single-leader
/// semantics).
pub async fn run_scheduler_tick(pool: &SqlitePool, scheduler_config: &SchedulerConfig, holder: &str) -> Result<bool> {
    let acquired = try_acquire_lock(pool, DEDUP_LOCK_KEY, holder, scheduler_config.lock_ttl_secs).await?;
    if !acquired {
        info!("scheduler: dedup lock held elsewhere, skipping this tick");
        return Ok(false);
    }

    let enqueued = enqueue(pool, "dedup", &serde_json::json!({}), scheduler_config).await;
    release_lock(pool, DEDUP_LOCK_KEY, holder).await?;
    enqueued?;
    Ok(true)
}

/// Enumerates documents with no chunk-node coverage in the graph store —
/// "lacking a derived artifact" (§4.7) — and enqueues a backfill job for
/// up to `limit` of them (capped at `backfill_max_limit`).
pub async fn run_backfill(pool: &SqlitePool, scheduler_config: &SchedulerConfig, limit: usize) -> Result<usize> {
    let limit = limit.min(scheduler_config.backfill_max_limit);

    let document_ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT d.id FROM documents d
        WHERE NOT EXISTS (SELECT 1 FROM chunk_nodes cn WHERE cn.document_id = d.id)
        ORDER BY d.id
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    for document_id in &document_ids {
        enqueue(
            pool,
            "backfill",
            &serde_json::json!({"document_id": document_id}),
            scheduler_config,
        )
        .await?;
    }

    Ok(document_ids.len())
}
