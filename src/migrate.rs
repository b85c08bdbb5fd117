//! Database schema migrations.
//!
//! One SQLite database backs every pluggable store named in §6 — vector,
//! graph, document, job queue, and distributed lock — as logically
//! separate tables. Creation is idempotent (`CREATE TABLE/INDEX IF NOT
//! EXISTS`) and runs at startup, matching §6's index-creation contract for
//! both the vector store's payload indexes and the graph store's
//! label-scoped indexes.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations_on(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn run_migrations_on(pool: &SqlitePool) -> Result<()> {
    // ---------- Document store ----------
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_id TEXT NOT NULL,
            document_type TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER,
            created_at_timestamp INTEGER,
            content_hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(tenant_id, source, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(tenant_id, content_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id)")
        .execute(pool)
        .await?;

    // ---------- Vector store (chunks + vectors) ----------
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            source TEXT NOT NULL,
            document_type TEXT NOT NULL,
            title TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            created_at INTEGER,
            created_at_timestamp INTEGER,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Payload indexes required by §6: document_type, created_at_timestamp,
    // source, tenant_id.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_type ON chunks(document_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_created_at_timestamp ON chunks(created_at_timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tenant_id ON chunks(tenant_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)",
    )
    .execute(pool)
    .await?;

    // Embedding transformation cache, keyed by hash of (normalized_text, model).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            cache_key TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ---------- Graph store ----------
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL,
            name TEXT NOT NULL,
            properties_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            created_at_timestamp INTEGER,
            relationship_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_label ON entities(label)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            source_label TEXT NOT NULL,
            relation_label TEXT NOT NULL,
            target_id TEXT NOT NULL,
            target_label TEXT NOT NULL,
            UNIQUE(source_id, relation_label, target_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_nodes (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            text TEXT NOT NULL,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            document_type TEXT NOT NULL,
            created_at INTEGER,
            created_at_timestamp INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_nodes_created_at_timestamp ON chunk_nodes(created_at_timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_nodes_document_id ON chunk_nodes(document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mentions_edges (
            chunk_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            PRIMARY KEY (chunk_id, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions_edges(entity_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sent_received_edges (
            person_entity_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            edge_type TEXT NOT NULL CHECK (edge_type IN ('SENT', 'RECEIVED')),
            PRIMARY KEY (person_entity_id, chunk_id, edge_type)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sent_received_chunk ON sent_received_edges(chunk_id)",
    )
    .execute(pool)
    .await?;

    // Closed (source_label, relation_label, target_label) validation schema.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relation_schema (
            source_label TEXT NOT NULL,
            relation_label TEXT NOT NULL,
            target_label TEXT NOT NULL,
            PRIMARY KEY (source_label, relation_label, target_label)
        )
        "#,
    )
    .execute(pool)
    .await?;
    seed_default_relation_schema(pool).await?;

    // ---------- Scheduler / worker substrate ----------
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            enqueued_at INTEGER NOT NULL,
            started_at INTEGER,
            deadline_at INTEGER,
            completed_at INTEGER,
            result_json TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, enqueued_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distributed_locks (
            lock_key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            dry_run INTEGER NOT NULL DEFAULT 0,
            duplicates_found INTEGER NOT NULL DEFAULT 0,
            entities_merged INTEGER NOT NULL DEFAULT 0,
            clusters_skipped INTEGER NOT NULL DEFAULT 0,
            embeddings_regenerated INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seeds the closed relation-validation schema with a representative set
/// matching the entity labels named in the domain model (PERSON, COMPANY,
/// ROLE, PURCHASE_ORDER, MATERIAL, CERTIFICATION). Operators extend this
/// table directly; it is not re-seeded destructively on subsequent runs.
async fn seed_default_relation_schema(pool: &SqlitePool) -> Result<()> {
    const DEFAULTS: &[(&str, &str, &str)] = &[
        ("PERSON", "WORKS_FOR", "COMPANY"),
        ("PERSON", "HAS_ROLE", "ROLE"),
        ("PERSON", "HOLDS_CERTIFICATION", "CERTIFICATION"),
        ("COMPANY", "SUPPLIES", "MATERIAL"),
        ("COMPANY", "ISSUED", "PURCHASE_ORDER"),
        ("PURCHASE_ORDER", "REQUIRES", "MATERIAL"),
        ("PURCHASE_ORDER", "REQUIRES", "CERTIFICATION"),
        ("MATERIAL", "CERTIFIED_BY", "CERTIFICATION"),
    ];

    for (s, r, t) in DEFAULTS {
        sqlx::query(
            "INSERT OR IGNORE INTO relation_schema (source_label, relation_label, target_label) VALUES (?, ?, ?)",
        )
        .bind(s)
        .bind(r)
        .bind(t)
        .execute(pool)
        .await?;
    }
    Ok(())
}
