//! Ingestion pipeline orchestration (§4.4).
//!
//! `ingest_document` runs the full prepare → dedupe → chunk/embed → vector
//! upsert → extract/validate → graph upsert flow for one document;
//! `ingest_batch` fans that out over many documents with two independent
//! concurrency bounds (`num_workers` for the vector-side work per document,
//! `max_concurrent_graph` for the graph-side work per chunk) matching the
//! teacher's inline, non-fatal embedding step in `run_sync`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::errors::CoreError;
use crate::graph::{self, EdgeDirection};
use crate::llm::LlmProvider;
use crate::models::{ChunkNode, DocumentRecord, Entity, IngestResult, IngestStatus, Relation};
use crate::retry::{classify_store_error, with_retry};
use crate::{chunk, docstore, extract, validator, vectorstore};

const METADATA_VALUE_MAX_CHARS: usize = 200;

/// Sanitizes a document's structured fields into the JSON blob stored
/// alongside it: scalar values pass through (truncated if a string),
/// arrays are flattened to a JSON-string representation, and nested
/// objects are stripped (§4.4 step 1 prepare).
fn sanitize_fields(fields: &HashMap<String, Value>) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in fields {
        let sanitized = match value {
            Value::String(s) => Value::String(truncate_chars(s, METADATA_VALUE_MAX_CHARS)),
            Value::Number(_) | Value::Bool(_) => value.clone(),
            Value::Array(_) => Value::String(truncate_chars(&value.to_string(), METADATA_VALUE_MAX_CHARS)),
            Value::Object(_) | Value::Null => continue,
        };
        out.insert(key.clone(), sanitized);
    }
    Value::Object(out)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn field_as_str<'a>(fields: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(|v| v.as_str())
}

fn field_as_str_list(fields: &HashMap<String, Value>, key: &str) -> Vec<String> {
    match fields.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn person_entity(name: &str) -> Entity {
    Entity {
        entity_id: Entity::derive_id("PERSON", name),
        label: "PERSON".to_string(),
        name: name.to_string(),
        properties: Default::default(),
        embedding: None,
        created_at_timestamp: None,
    }
}

fn llm_provider_enabled(provider: &dyn LlmProvider) -> bool {
    provider.model_name() != "disabled"
}

/// Wraps a graph/vector store call in the same retry decorator used for
/// embedding/extraction model calls (§4.4), retrying only the transient
/// (lock-contention) failures [`classify_store_error`] recognizes.
async fn with_store_retry<T, F, Fut>(f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut f = f;
    with_retry(crate::retry::STORE_RETRY_ATTEMPTS, move || {
        let fut = f();
        async move { fut.await.map_err(classify_store_error) }
    })
    .await
    .map_err(Into::into)
}

/// Ingests a single document end to end (§4.4). Idempotent: re-ingesting
/// the same `(tenant_id, source, source_id)` replaces its chunks/vectors
/// and upserts (never duplicates) its graph nodes (invariant 6).
pub async fn ingest_document(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    graph_semaphore: &Semaphore,
    relation_schema: &[(String, String, String)],
    record: &DocumentRecord,
) -> IngestResult {
    let document_id = record.doc_id.clone();

    let content_hash = record.content_hash();
    match docstore::find_by_content_hash(pool, &record.tenant_id, &content_hash).await {
        Ok(Some(existing_id)) if existing_id != document_id => {
            return IngestResult {
                status: IngestStatus::Skipped,
                document_id: existing_id,
                chunks_written: 0,
                entities_written: 0,
                relations_written: 0,
                error: Some("duplicate content hash".to_string()),
            };
        }
        Ok(_) => {}
        Err(e) => {
            return IngestResult {
                status: IngestStatus::Error,
                document_id,
                chunks_written: 0,
                entities_written: 0,
                relations_written: 0,
                error: Some(e.to_string()),
            };
        }
    }

    let created_at_timestamp = match record.created_at {
        Some(dt) => Some(dt.timestamp()),
        None => match &record.parent_doc_id {
            Some(parent_id) => docstore::find_created_at_timestamp(pool, parent_id).await.ok().flatten(),
            None => None,
        },
    };

    let metadata_json = sanitize_fields(&record.fields).to_string();

    let document_id = match docstore::upsert(pool, record, created_at_timestamp, &metadata_json).await {
        Ok(id) => id,
        Err(e) => {
            return IngestResult {
                status: IngestStatus::Error,
                document_id,
                chunks_written: 0,
                entities_written: 0,
                relations_written: 0,
                error: Some(e.to_string()),
            };
        }
    };

    let chunks = chunk::chunk_text(
        &document_id,
        &record.normalized_content(),
        config.chunking.target_size,
        config.chunking.overlap,
        &record.tenant_id,
        &record.source,
        &record.document_type,
        &record.title,
        record.created_at,
        created_at_timestamp,
    );

    let vectors = if config.embedding.is_enabled() {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let result = with_retry(config.embedding.max_retries as usize + 1, || async {
            crate::embedding::embed_texts_cached(pool, embedding_provider, &config.embedding, &texts)
                .await
                .map_err(|e| CoreError::Embedding(e.to_string()))
        })
        .await;
        match result {
            Ok(v) => v,
            Err(e) => {
                // A persistent embedding failure aborts the document rather than
                // storing vector-less chunks that would silently be unsearchable
                // while reported as ingested (§4.1, §7 `EmbeddingError`).
                return IngestResult {
                    status: IngestStatus::Error,
                    document_id,
                    chunks_written: 0,
                    entities_written: 0,
                    relations_written: 0,
                    error: Some(e.to_string()),
                };
            }
        }
    } else {
        vec![Vec::new(); chunks.len()]
    };

    let upsert_result = with_retry(crate::retry::STORE_RETRY_ATTEMPTS, || async {
        vectorstore::upsert_chunks(pool, &document_id, &chunks, &vectors)
            .await
            .map_err(classify_store_error)
    })
    .await;
    if let Err(e) = upsert_result {
        return IngestResult {
            status: IngestStatus::Error,
            document_id,
            chunks_written: 0,
            entities_written: 0,
            relations_written: 0,
            error: Some(e.to_string()),
        };
    }

    let email_senders: Vec<String> = if record.document_type == "email" {
        field_as_str(&record.fields, "sender").map(|s| vec![s.to_string()]).unwrap_or_default()
    } else {
        Vec::new()
    };
    let email_recipients: Vec<String> = if record.document_type == "email" {
        field_as_str_list(&record.fields, "recipients")
    } else {
        Vec::new()
    };

    if let Err(e) = graph::delete_chunk_nodes_for_document(pool, &document_id).await {
        warn!(document_id = %document_id, error = %e, "failed to clear stale graph nodes before re-ingestion");
    }

    let mut entities_written = 0usize;
    let mut relations_written = 0usize;
    let mut graph_errors = 0usize;

    for chunk in &chunks {
        let _permit = graph_semaphore.acquire().await;
        let chunk_node = ChunkNode {
            chunk_id: chunk.chunk_id.clone(),
            document_id: document_id.clone(),
            text: chunk.text.clone(),
            title: chunk.title.clone(),
            source: chunk.source.clone(),
            document_type: chunk.document_type.clone(),
            created_at: chunk.created_at,
            created_at_timestamp: chunk.created_at_timestamp,
        };

        match ingest_chunk_graph(
            pool,
            config,
            embedding_provider,
            llm_provider,
            relation_schema,
            &chunk_node,
            &email_senders,
            &email_recipients,
        )
        .await
        {
            Ok((e, r)) => {
                entities_written += e;
                relations_written += r;
            }
            Err(e) => {
                warn!(chunk_id = %chunk.chunk_id, error = %e, "graph upsert failed for chunk");
                graph_errors += 1;
            }
        }
    }

    let status = if graph_errors > 0 {
        IngestStatus::PartialSuccess
    } else {
        IngestStatus::Success
    };

    IngestResult {
        status,
        document_id,
        chunks_written: chunks.len(),
        entities_written,
        relations_written,
        error: None,
    }
}

/// Runs the graph-side extraction/validation/upsert pass for a single
/// chunk, per §4.4 steps 4a-4e. Errors here never fail the document —
/// the caller records them as a partial success.
#[allow(clippy::too_many_arguments)]
async fn ingest_chunk_graph(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    relation_schema: &[(String, String, String)],
    chunk_node: &ChunkNode,
    email_senders: &[String],
    email_recipients: &[String],
) -> anyhow::Result<(usize, usize)> {
    with_store_retry(|| graph::upsert_chunk_node(pool, chunk_node)).await?;

    let mut entities_written = 0usize;
    let mut relations_written = 0usize;

    for sender in email_senders {
        let entity = person_entity(sender);
        with_store_retry(|| graph::upsert_entity(pool, &entity)).await?;
        with_store_retry(|| graph::add_mentions_edge(pool, &chunk_node.chunk_id, &entity.entity_id)).await?;
        with_store_retry(|| graph::add_sent_received_edge(pool, &entity.entity_id, &chunk_node.chunk_id, EdgeDirection::Sent)).await?;
    }
    for recipient in email_recipients {
        let entity = person_entity(recipient);
        with_store_retry(|| graph::upsert_entity(pool, &entity)).await?;
        with_store_retry(|| graph::add_mentions_edge(pool, &chunk_node.chunk_id, &entity.entity_id)).await?;
        with_store_retry(|| graph::add_sent_received_edge(pool, &entity.entity_id, &chunk_node.chunk_id, EdgeDirection::Received)).await?;
    }

    if !llm_provider_enabled(llm_provider) {
        return Ok((entities_written, relations_written));
    }

    let extraction = with_retry(config.llm.max_retries as usize + 1, || async {
        extract::extract(llm_provider, &config.llm, &config.extraction, &chunk_node.text, relation_schema)
            .await
            .map_err(|e| CoreError::Extraction(e.to_string()))
    })
    .await;

    let extraction = match extraction {
        Ok(result) => result,
        Err(e) => {
            warn!(chunk_id = %chunk_node.chunk_id, error = %e, "extraction failed, chunk stored without graph data");
            return Ok((entities_written, relations_written));
        }
    };

    for entity in extraction.entities {
        let mut entity = entity;
        if config.embedding.is_enabled() {
            if let Ok(mut embedded) =
                crate::embedding::embed_texts_cached(pool, embedding_provider, &config.embedding, &[entity.embedding_text()]).await
            {
                entity.embedding = embedded.pop();
            }
        }
        with_store_retry(|| graph::upsert_entity(pool, &entity)).await?;
        with_store_retry(|| graph::add_mentions_edge(pool, &chunk_node.chunk_id, &entity.entity_id)).await?;
        entities_written += 1;
    }

    let accepted = validator::validate(llm_provider, &config.llm, &config.extraction, &chunk_node.text, extraction.candidates).await;

    for candidate in accepted {
        let relation = Relation {
            source_id: Entity::derive_id(&candidate.source_label, &candidate.source_name),
            source_label: candidate.source_label,
            relation_label: candidate.relation_label,
            target_id: Entity::derive_id(&candidate.target_label, &candidate.target_name),
            target_label: candidate.target_label,
        };
        if with_store_retry(|| graph::upsert_relation(pool, &relation)).await? {
            relations_written += 1;
        }
    }

    Ok((entities_written, relations_written))
}

/// Ingests many documents with bounded concurrency: up to
/// `config.ingestion.num_workers` documents proceed through prepare/
/// chunk/embed/vector-upsert concurrently, while graph-side work across
/// all in-flight documents shares a single `max_concurrent_graph`
/// semaphore (§4.4).
pub async fn ingest_batch(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    records: Vec<DocumentRecord>,
) -> Vec<IngestResult> {
    let relation_schema = graph::relation_schema(pool).await.unwrap_or_default();
    let graph_semaphore = Arc::new(Semaphore::new(config.ingestion.max_concurrent_graph.max(1)));
    let num_workers = config.ingestion.num_workers.max(1);

    stream::iter(records)
        .map(|record| {
            let graph_semaphore = Arc::clone(&graph_semaphore);
            let relation_schema = &relation_schema;
            async move {
                ingest_document(
                    pool,
                    config,
                    embedding_provider,
                    llm_provider,
                    &graph_semaphore,
                    relation_schema,
                    &record,
                )
                .await
            }
        })
        .buffer_unordered(num_workers)
        .collect()
        .await
}
