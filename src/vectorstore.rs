//! Vector store operations (§6).
//!
//! Chunks and their vectors live in the teacher's `chunks`/`chunk_vectors`
//! tables, generalized here into an upsert-by-`document_id` strategy and a
//! metadata-filter-tree-aware nearest-neighbour search. Payload indexes on
//! `document_type`,
//! `created_at_timestamp`, `source`, `tenant_id` are created idempotently
//! by `migrate.rs`.

use anyhow::Result;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::Chunk;

/// A leaf of the metadata-filter tree the hybrid query engine builds
/// (§4.6 step 3; §6 `EQ`, `GTE`, `LTE`, `IN`).
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, String),
    Gte(String, i64),
    Lte(String, i64),
    In(String, Vec<String>),
}

/// A point retrieved by nearest-neighbour search, with its similarity score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub document_type: String,
    pub created_at_timestamp: Option<i64>,
    pub score: f32,
}

/// Replaces all chunks (and their vectors) for `document_id` with
/// `chunks`/`vectors`, per §4.4 step 3's UPSERT-by-`document_id` strategy.
pub async fn upsert_chunks(
    pool: &SqlitePool,
    document_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, tenant_id, source, document_type, title, chunk_index, text, hash, created_at, created_at_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.document_id)
        .bind(&chunk.tenant_id)
        .bind(&chunk.source)
        .bind(&chunk.document_type)
        .bind(&chunk.title)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.text_hash())
        .bind(chunk.created_at.map(|dt| dt.timestamp()))
        .bind(chunk.created_at_timestamp)
        .execute(&mut *tx)
        .await?;

        if !vector.is_empty() {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.document_id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    match filter {
        Filter::Eq(field, value) => {
            qb.push(" AND c.");
            qb.push(field);
            qb.push(" = ");
            qb.push_bind(value.clone());
        }
        Filter::Gte(field, value) => {
            qb.push(" AND c.");
            qb.push(field);
            qb.push(" >= ");
            qb.push_bind(*value);
        }
        Filter::Lte(field, value) => {
            qb.push(" AND c.");
            qb.push(field);
            qb.push(" <= ");
            qb.push_bind(*value);
        }
        Filter::In(field, values) => {
            qb.push(" AND c.");
            qb.push(field);
            qb.push(" IN (");
            let mut sep = qb.separated(", ");
            for v in values {
                sep.push_bind(v.clone());
            }
            qb.push(")");
        }
    }
}

/// Only these fields may appear in a [`Filter`] — guards against building
/// a query against an arbitrary column name.
const FILTERABLE_FIELDS: &[&str] = &["document_type", "created_at_timestamp", "source", "tenant_id"];

fn validate_filters(filters: &[Filter]) -> Result<()> {
    for f in filters {
        let field = match f {
            Filter::Eq(field, _) | Filter::Gte(field, _) | Filter::Lte(field, _) | Filter::In(field, _) => field,
        };
        if !FILTERABLE_FIELDS.contains(&field.as_str()) {
            anyhow::bail!("unsupported filter field: {}", field);
        }
    }
    Ok(())
}

/// Nearest-neighbour search over all chunk vectors matching `filters`,
/// enforced at the database level per §4.6 step 3 — chunks outside the
/// filter are never fetched, let alone scored.
pub async fn search(
    pool: &SqlitePool,
    tenant_id: &str,
    query_vector: &[f32],
    filters: &[Filter],
    top_k: i64,
) -> Result<Vec<VectorHit>> {
    validate_filters(filters)?;

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT c.id, c.document_id, c.text, c.title, c.source, c.document_type, c.created_at_timestamp, cv.embedding \
         FROM chunks c JOIN chunk_vectors cv ON cv.chunk_id = c.id \
         WHERE c.tenant_id = ",
    );
    qb.push_bind(tenant_id.to_string());
    for f in filters {
        push_filter(&mut qb, f);
    }

    let rows = qb.build().fetch_all(pool).await?;

    let mut hits: Vec<VectorHit> = rows
        .into_iter()
        .map(|row| {
            let embedding: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&embedding);
            let score = cosine_similarity(query_vector, &vector);
            VectorHit {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                text: row.get("text"),
                title: row.get("title"),
                source: row.get("source"),
                document_type: row.get("document_type"),
                created_at_timestamp: row.get("created_at_timestamp"),
                score,
            }
        })
        .collect();

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k.max(0) as usize);
    Ok(hits)
}

/// Deletes all chunks (and vectors) for `document_id` (§6 delete
/// by filter, scoped to the document granularity the pipeline needs).
pub async fn delete_by_document(pool: &SqlitePool, document_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
