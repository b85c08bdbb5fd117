//! Database statistics and health overview.
//!
//! Summarizes what's indexed across all three stores — document counts,
//! chunk/embedding coverage, graph entity/relation counts, and pending
//! job-queue backlog. Used by `synapse stats` to give confidence that
//! ingestion and dedup are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::graph;

/// Per-tenant breakdown of document and chunk counts.
struct TenantStats {
    tenant_id: String,
    doc_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;

    let entity_count = graph::entity_count(&pool).await?;
    let relation_count = graph::relation_count(&pool).await?;

    let jobs_queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
        .fetch_one(&pool)
        .await?;
    let jobs_failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'failed'")
        .fetch_one(&pool)
        .await?;

    let last_dedup_run = sqlx::query(
        "SELECT finished_at, entities_merged FROM dedup_runs WHERE finished_at IS NOT NULL ORDER BY finished_at DESC LIMIT 1",
    )
    .fetch_optional(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Synapse Core — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!();
    println!("  Graph entities:  {}", entity_count);
    println!("  Graph relations: {}", relation_count);
    println!();
    println!("  Jobs queued: {}", jobs_queued);
    println!("  Jobs failed: {}", jobs_failed);
    match last_dedup_run {
        Some(row) => {
            let finished_at: i64 = row.get("finished_at");
            let merged: i64 = row.get("entities_merged");
            println!(
                "  Last dedup:  {} ({} entities merged)",
                format_ts_relative(finished_at),
                merged
            );
        }
        None => println!("  Last dedup:  never"),
    }

    // Per-tenant breakdown
    let tenant_rows = sqlx::query(
        r#"
        SELECT
            d.tenant_id,
            COUNT(DISTINCT d.id) AS doc_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY d.tenant_id
        ORDER BY doc_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let tenant_stats: Vec<TenantStats> = tenant_rows
        .iter()
        .map(|row| TenantStats {
            tenant_id: row.get("tenant_id"),
            doc_count: row.get("doc_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !tenant_stats.is_empty() {
        println!();
        println!("  By tenant:");
        println!(
            "  {:<24} {:>6} {:>8} {:>10}",
            "TENANT", "DOCS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(52));

        for t in &tenant_stats {
            println!(
                "  {:<24} {:>6} {:>8} {:>10}",
                t.tenant_id, t.doc_count, t.chunk_count, t.embedded_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
