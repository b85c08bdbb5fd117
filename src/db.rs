//! SQLite connection pool.
//!
//! One pool backs all of the pluggable stores from §6 (vector, graph,
//! document, job queue, distributed lock) — each is a logically separate
//! set of tables (see `migrate.rs`), not a separate connection. The pool
//! size is sized against `ingestion.graph_pool_size` (recommended 50; §5),
//! which `ingestion.max_concurrent_graph` must stay under to avoid pool
//! exhaustion.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.ingestion.graph_pool_size as u32)
        .connect_with(options)
        .await?;

    Ok(pool)
}
