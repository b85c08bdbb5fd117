//! Graph store operations (§6).
//!
//! Entities, relations, chunk nodes and their edges live in the
//! `entities`/`relations`/`chunk_nodes`/`mentions_edges`/
//! `sent_received_edges` tables created by `migrate.rs`. Entities are
//! merged by `(label, name)` (§4.4 step 4a), relations are rejected at
//! upsert time if they are not in the closed `relation_schema` table
//! (testable property 3), and chunk-node timestamps are the sole carrier
//! of time for graph-side queries (§3).

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::embedding::vec_to_blob;
use crate::models::{ChunkNode, Entity, Relation};

/// Upserts a chunk node keyed by `chunk_id` (§4.4 step 4a).
pub async fn upsert_chunk_node(pool: &SqlitePool, node: &ChunkNode) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunk_nodes (chunk_id, document_id, text, title, source, document_type, created_at, created_at_timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            text = excluded.text,
            title = excluded.title,
            source = excluded.source,
            document_type = excluded.document_type,
            created_at = excluded.created_at,
            created_at_timestamp = excluded.created_at_timestamp
        "#,
    )
    .bind(&node.chunk_id)
    .bind(&node.document_id)
    .bind(&node.text)
    .bind(&node.title)
    .bind(&node.source)
    .bind(&node.document_type)
    .bind(node.created_at.map(|dt| dt.timestamp()))
    .bind(node.created_at_timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

/// Deletes a document's chunk nodes and their edges, mirroring
/// `vectorstore::delete_by_document` so re-ingestion starts clean.
pub async fn delete_chunk_nodes_for_document(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM mentions_edges WHERE chunk_id IN (SELECT chunk_id FROM chunk_nodes WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM sent_received_edges WHERE chunk_id IN (SELECT chunk_id FROM chunk_nodes WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunk_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Upserts an entity, merging by `(label, name)` via its derived
/// `entity_id` (§4.4 step 4b). `properties` are set only when the entity
/// is newly created — existing properties are left untouched by document
/// ingestion; only the dedup engine's merge rules (§4.5) mutate them
/// afterwards.
pub async fn upsert_entity(pool: &SqlitePool, entity: &Entity) -> Result<()> {
    let properties_json = serde_json::to_string(&entity.properties)?;
    let embedding_blob = entity.embedding.as_ref().map(|e| vec_to_blob(e));

    sqlx::query(
        r#"
        INSERT INTO entities (entity_id, label, name, properties_json, embedding, created_at_timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            embedding = COALESCE(excluded.embedding, entities.embedding)
        "#,
    )
    .bind(&entity.entity_id)
    .bind(&entity.label)
    .bind(&entity.name)
    .bind(properties_json)
    .bind(embedding_blob)
    .bind(entity.created_at_timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns the `(source_label, relation_label, target_label)` triples
/// permitted by the closed validation schema (§3 invariant 3).
pub async fn relation_schema(pool: &SqlitePool) -> Result<Vec<(String, String, String)>> {
    let rows = sqlx::query(
        "SELECT source_label, relation_label, target_label FROM relation_schema",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("source_label"), r.get("relation_label"), r.get("target_label")))
        .collect())
}

/// Upserts a relation after checking it conforms to `relation_schema`;
/// non-conforming relations are rejected rather than silently dropped
/// here (the extractor already filters non-conforming triples at §4.2 —
/// this is the store-level backstop for testable property 3). Only bumps
/// `relationship_count` on the two endpoints when the triple is newly
/// inserted, so re-ingesting a document that re-extracts the same
/// relation leaves the count (and the dedup primary-selection key it
/// feeds, §4.5) unchanged.
pub async fn upsert_relation(pool: &SqlitePool, relation: &Relation) -> Result<bool> {
    let allowed: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM relation_schema WHERE source_label = ? AND relation_label = ? AND target_label = ?",
    )
    .bind(&relation.source_label)
    .bind(&relation.relation_label)
    .bind(&relation.target_label)
    .fetch_one(pool)
    .await?;

    if !allowed {
        return Ok(false);
    }

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO relations (source_id, source_label, relation_label, target_id, target_label)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&relation.source_id)
    .bind(&relation.source_label)
    .bind(&relation.relation_label)
    .bind(&relation.target_id)
    .bind(&relation.target_label)
    .execute(pool)
    .await?;

    if inserted.rows_affected() > 0 {
        bump_relationship_count(pool, &relation.source_id).await?;
        bump_relationship_count(pool, &relation.target_id).await?;
    }
    Ok(true)
}

async fn bump_relationship_count(pool: &SqlitePool, entity_id: &str) -> Result<()> {
    sqlx::query("UPDATE entities SET relationship_count = relationship_count + 1 WHERE entity_id = ?")
        .bind(entity_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Inserts a MENTIONS edge from a chunk node to an entity (§4.4 step 4d).
pub async fn add_mentions_edge(pool: &SqlitePool, chunk_id: &str, entity_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO mentions_edges (chunk_id, entity_id) VALUES (?, ?)")
        .bind(chunk_id)
        .bind(entity_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Sent,
    Received,
}

impl EdgeDirection {
    fn as_str(self) -> &'static str {
        match self {
            EdgeDirection::Sent => "SENT",
            EdgeDirection::Received => "RECEIVED",
        }
    }
}

/// Inserts a SENT/RECEIVED edge from a PERSON entity to a chunk node, for
/// email documents (§4.4 step 4e).
pub async fn add_sent_received_edge(
    pool: &SqlitePool,
    person_entity_id: &str,
    chunk_id: &str,
    direction: EdgeDirection,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO sent_received_edges (person_entity_id, chunk_id, edge_type) VALUES (?, ?, ?)",
    )
    .bind(person_entity_id)
    .bind(chunk_id)
    .bind(direction.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// A node reached by graph retrieval, carrying only the whitelisted
/// fields `{text, label, type, name, title, created_at,
/// created_at_timestamp}` per §4.6 step 5.
#[derive(Debug, Clone)]
pub struct GraphHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub document_type: String,
    pub created_at_timestamp: Option<i64>,
}

/// Templated read-only retrieval for time-filtered questions (§4.6 step
/// 5): chunk nodes whose timestamp falls in `[start, end]`, restricted to
/// the whitelisted field set — no free-form query generation, since the
/// schema and filter are fixed here rather than LLM-generated.
pub async fn query_chunk_nodes_in_window(
    pool: &SqlitePool,
    start_timestamp: i64,
    end_timestamp: i64,
    limit: i64,
) -> Result<Vec<GraphHit>> {
    let rows = sqlx::query(
        r#"
        SELECT chunk_id, document_id, text, title, source, document_type, created_at_timestamp
        FROM chunk_nodes
        WHERE created_at_timestamp >= ? AND created_at_timestamp <= ?
        ORDER BY created_at_timestamp DESC
        LIMIT ?
        "#,
    )
    .bind(start_timestamp)
    .bind(end_timestamp)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| GraphHit {
            chunk_id: r.get("chunk_id"),
            document_id: r.get("document_id"),
            text: r.get("text"),
            title: r.get("title"),
            source: r.get("source"),
            document_type: r.get("document_type"),
            created_at_timestamp: r.get("created_at_timestamp"),
        })
        .collect())
}

/// Finds entities whose name matches one of `keywords` (case-insensitive
/// substring), the synonym retriever's entry point for untimed questions
/// (§4.6 step 5).
pub async fn find_entities_by_keywords(
    pool: &SqlitePool,
    keywords: &[String],
) -> Result<Vec<Entity>> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen: HashMap<String, Entity> = HashMap::new();
    for kw in keywords {
        let pattern = format!("%{}%", kw.to_lowercase());
        let rows = sqlx::query(
            "SELECT entity_id, label, name, properties_json FROM entities WHERE lower(name) LIKE ?",
        )
        .bind(pattern)
        .fetch_all(pool)
        .await?;
        for row in rows {
            let entity_id: String = row.get("entity_id");
            if seen.contains_key(&entity_id) {
                continue;
            }
            let properties_json: String = row.get("properties_json");
            let properties = serde_json::from_str(&properties_json).unwrap_or_default();
            seen.insert(
                entity_id.clone(),
                Entity {
                    entity_id,
                    label: row.get("label"),
                    name: row.get("name"),
                    properties,
                    embedding: None,
                    created_at_timestamp: None,
                },
            );
        }
    }
    Ok(seen.into_values().collect())
}

/// Expands an entity's neighbourhood by 2 hops via `mentions_edges` and
/// `relations`, returning the chunk nodes reached — the vector-context
/// retriever's graph-side expansion for untimed questions (§4.6 step 5).
pub async fn expand_two_hops(pool: &SqlitePool, entity_ids: &[String]) -> Result<Vec<GraphHit>> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
        r#"
        WITH RECURSIVE neighbor_entities(entity_id, hop) AS (
            SELECT entity_id, 0 FROM entities WHERE entity_id IN (
        "#,
    );
    {
        let mut sep = qb.separated(", ");
        for id in entity_ids {
            sep.push_bind(id.clone());
        }
    }
    qb.push(
        r#"
            )
            UNION
            SELECT r.target_id, n.hop + 1
            FROM relations r
            JOIN neighbor_entities n ON n.entity_id = r.source_id
            WHERE n.hop < 2
            UNION
            SELECT r.source_id, n.hop + 1
            FROM relations r
            JOIN neighbor_entities n ON n.entity_id = r.target_id
            WHERE n.hop < 2
        )
        SELECT DISTINCT cn.chunk_id, cn.document_id, cn.text, cn.title, cn.source, cn.document_type, cn.created_at_timestamp
        FROM chunk_nodes cn
        JOIN mentions_edges m ON m.chunk_id = cn.chunk_id
        JOIN neighbor_entities n ON n.entity_id = m.entity_id
        "#,
    );

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|r| GraphHit {
            chunk_id: r.get("chunk_id"),
            document_id: r.get("document_id"),
            text: r.get("text"),
            title: r.get("title"),
            source: r.get("source"),
            document_type: r.get("document_type"),
            created_at_timestamp: r.get("created_at_timestamp"),
        })
        .collect())
}

pub async fn entity_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entities").fetch_one(pool).await?)
}

pub async fn relation_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM relations").fetch_one(pool).await?)
}
