//! Document metadata store (§6).
//!
//! Upserts and looks up document metadata rows keyed by
//! `(tenant_id, source, source_id)`, and supports the two dedup/ get
//! queries the ingestion pipeline and CLI need: by `content_hash` and by
//! `document_id`. Grounded on the teacher's `upsert_document` in
//! `ingest.rs`, generalized with a tenant column and a `content_hash`
//! rather than a timestamp-mixed `dedup_hash`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::DocumentRecord;

/// Row materialised from the `documents` table.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub doc_id: String,
    pub tenant_id: String,
    pub source: String,
    pub source_id: String,
    pub document_type: String,
    pub title: String,
    pub content: String,
    pub created_at_timestamp: Option<i64>,
    pub content_hash: String,
}

/// Looks up a prior document by content hash for the same tenant, per
/// §4.4 step 2 (dedup against the document store).
pub async fn find_by_content_hash(
    pool: &SqlitePool,
    tenant_id: &str,
    content_hash: &str,
) -> Result<Option<String>> {
    let doc_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM documents WHERE tenant_id = ? AND content_hash = ?",
    )
    .bind(tenant_id)
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;
    Ok(doc_id)
}

/// Looks up a document's timestamp by id, used to let attachments inherit
/// their parent document's `created_at_timestamp` (§4.4 step 1).
pub async fn find_created_at_timestamp(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<i64>> {
    let ts: Option<Option<i64>> =
        sqlx::query_scalar("SELECT created_at_timestamp FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    Ok(ts.flatten())
}

/// Reconstructs a [`DocumentRecord`] from its stored row, for the
/// scheduler's backfill task to re-derive a document's chunks/graph nodes
/// without the original caller resubmitting it (§4.7). `fields` is
/// rebuilt from the sanitized `metadata_json` blob, so an array-valued
/// field (e.g. email recipients) round-trips as the truncated JSON string
/// `sanitize_fields` already stores rather than the original array.
pub async fn get_as_record(pool: &SqlitePool, document_id: &str) -> Result<Option<DocumentRecord>> {
    let row: Option<(String, String, String, String, String, String, String, Option<i64>, String)> = sqlx::query_as(
        "SELECT id, tenant_id, source, source_id, document_type, title, content, created_at_timestamp, metadata_json FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(doc_id, tenant_id, source, source_id, document_type, title, content, created_at_timestamp, metadata_json)| {
            let fields = serde_json::from_str(&metadata_json).unwrap_or_default();
            DocumentRecord {
                doc_id,
                tenant_id,
                source,
                source_id,
                document_type,
                title,
                content,
                created_at: created_at_timestamp.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
                fields,
                parent_doc_id: None,
            }
        },
    ))
}

pub async fn get(pool: &SqlitePool, document_id: &str) -> Result<Option<DocumentRow>> {
    let row: Option<(String, String, String, String, String, String, String, Option<i64>, String)> = sqlx::query_as(
        "SELECT id, tenant_id, source, source_id, document_type, title, content, created_at_timestamp, content_hash FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(doc_id, tenant_id, source, source_id, document_type, title, content, created_at_timestamp, content_hash)| {
            DocumentRow {
                doc_id,
                tenant_id,
                source,
                source_id,
                document_type,
                title,
                content,
                created_at_timestamp,
                content_hash,
            }
        },
    ))
}

/// Upserts a document metadata row keyed by `(tenant_id, source,
/// source_id)` (§6). `created_at_timestamp` is the canonical timestamp
/// computed/inherited during the prepare step.
pub async fn upsert(
    pool: &SqlitePool,
    record: &DocumentRecord,
    created_at_timestamp: Option<i64>,
    metadata_json: &str,
) -> Result<String> {
    let content_hash = record.content_hash();
    let created_at = record.created_at.map(|dt| dt.timestamp());

    sqlx::query(
        r#"
        INSERT INTO documents (id, tenant_id, source, source_id, document_type, title, content, created_at, created_at_timestamp, content_hash, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tenant_id, source, source_id) DO UPDATE SET
            document_type = excluded.document_type,
            title = excluded.title,
            content = excluded.content,
            created_at = excluded.created_at,
            created_at_timestamp = excluded.created_at_timestamp,
            content_hash = excluded.content_hash,
            metadata_json = excluded.metadata_json
        "#,
    )
    .bind(&record.doc_id)
    .bind(&record.tenant_id)
    .bind(&record.source)
    .bind(&record.source_id)
    .bind(&record.document_type)
    .bind(&record.title)
    .bind(record.normalized_content())
    .bind(created_at)
    .bind(created_at_timestamp)
    .bind(&content_hash)
    .bind(metadata_json)
    .execute(pool)
    .await?;

    let doc_id: String = sqlx::query_scalar(
        "SELECT id FROM documents WHERE tenant_id = ? AND source = ? AND source_id = ?",
    )
    .bind(&record.tenant_id)
    .bind(&record.source)
    .bind(&record.source_id)
    .fetch_one(pool)
    .await?;

    Ok(doc_id)
}
