//! Document retrieval by ID.
//!
//! Fetches a document, its chunks, and the graph entities it mentions.
//! Used by the `synapse get` CLI command.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub tenant_id: String,
    pub source: String,
    pub source_id: String,
    pub document_type: String,
    pub title: String,
    pub content: String,
    pub created_at: Option<String>,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
    pub mentioned_entities: Vec<EntityResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityResponse {
    pub entity_id: String,
    pub label: String,
    pub name: String,
}

/// Core get function returning structured data, used by the CLI.
pub async fn get_document(config: &Config, id: &str) -> Result<DocumentResponse> {
    let pool = db::connect(config).await?;

    let doc_row = sqlx::query(
        "SELECT id, tenant_id, source, source_id, document_type, title, content, created_at_timestamp, metadata_json FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&pool)
    .await?;

    let doc_row = match doc_row {
        Some(row) => row,
        None => {
            pool.close().await;
            bail!("document not found: {}", id);
        }
    };

    let created_at: Option<i64> = doc_row.get("created_at_timestamp");
    let metadata_json: String = doc_row.get("metadata_json");
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    let chunk_rows = sqlx::query(
        "SELECT chunk_index, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(&pool)
    .await?;

    let chunks: Vec<ChunkResponse> = chunk_rows
        .iter()
        .map(|row| ChunkResponse {
            index: row.get("chunk_index"),
            text: row.get("text"),
        })
        .collect();

    let entity_rows = sqlx::query(
        r#"
        SELECT DISTINCT e.entity_id, e.label, e.name
        FROM entities e
        JOIN mentions_edges m ON m.entity_id = e.entity_id
        JOIN chunk_nodes cn ON cn.chunk_id = m.chunk_id
        WHERE cn.document_id = ?
        "#,
    )
    .bind(id)
    .fetch_all(&pool)
    .await?;

    let mentioned_entities: Vec<EntityResponse> = entity_rows
        .iter()
        .map(|row| EntityResponse {
            entity_id: row.get("entity_id"),
            label: row.get("label"),
            name: row.get("name"),
        })
        .collect();

    pool.close().await;

    Ok(DocumentResponse {
        id: doc_row.get("id"),
        tenant_id: doc_row.get("tenant_id"),
        source: doc_row.get("source"),
        source_id: doc_row.get("source_id"),
        document_type: doc_row.get("document_type"),
        title: doc_row.get("title"),
        content: doc_row.get("content"),
        created_at: created_at.map(format_ts_iso),
        metadata,
        chunks,
        mentioned_entities,
    })
}

/// CLI entry point — calls `get_document` and prints to stdout.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let doc = match get_document(config, id).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("--- Document ---");
    println!("id:            {}", doc.id);
    println!("tenant:        {}", doc.tenant_id);
    println!("title:         {}", doc.title);
    println!("source:        {}", doc.source);
    println!("source_id:     {}", doc.source_id);
    println!("document_type: {}", doc.document_type);
    if let Some(ref ts) = doc.created_at {
        println!("created_at:    {}", ts);
    }
    println!("metadata:      {}", doc.metadata);
    println!();

    println!("--- Content ---");
    println!("{}", doc.content);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}]", chunk.index);
        println!("{}", chunk.text);
        println!();
    }

    println!(
        "--- Mentioned entities ({}) ---",
        doc.mentioned_entities.len()
    );
    for entity in &doc.mentioned_entities {
        println!("{} {} ({})", entity.label, entity.name, entity.entity_id);
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
