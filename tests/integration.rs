//! End-to-end scenarios against a real SQLite file, exercising the
//! testable properties named in the specification: idempotent ingestion
//! (S1), entity dedup merge (S2), time-window filtered vector search
//! (S3), validator rejection (S5), and an untimed hybrid query (S6).
//!
//! The embedding/LLM providers used here are `"disabled"` — no network
//! calls are made. Where a scenario needs vectors or graph data that
//! would normally come from those providers (chunk embeddings, extracted
//! entities), the test seeds them directly through the same store
//! functions the pipeline itself calls.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use synapse_core::config::{Config, DbConfig};
use synapse_core::models::{CandidateTriple, DocumentRecord, Entity};
use synapse_core::{chunk, db, dedup, embedding, extract, graph, ingest, llm, migrate, query, rerank, validator, vectorstore};

fn test_config(db_path: PathBuf) -> Config {
    Config {
        db: DbConfig { path: db_path },
        chunking: Default::default(),
        retrieval: Default::default(),
        embedding: Default::default(),
        llm: Default::default(),
        rerank: Default::default(),
        ingestion: Default::default(),
        extraction: Default::default(),
        dedup: Default::default(),
        scheduler: Default::default(),
    }
}

async fn fresh_pool(dir: &TempDir) -> (Config, sqlx::SqlitePool) {
    let cfg = test_config(dir.path().join("synapse.sqlite"));
    let pool = db::connect(&cfg).await.expect("connect");
    migrate::run_migrations_on(&pool).await.expect("migrate");
    (cfg, pool)
}

fn email_record(doc_id: &str, title: &str, content: &str, sender: &str, recipients: &[&str]) -> DocumentRecord {
    let mut fields = HashMap::new();
    fields.insert("sender".to_string(), serde_json::json!(sender));
    fields.insert("recipients".to_string(), serde_json::json!(recipients));
    DocumentRecord {
        doc_id: doc_id.to_string(),
        tenant_id: "T".to_string(),
        source: "mail".to_string(),
        source_id: doc_id.to_string(),
        document_type: "email".to_string(),
        title: title.to_string(),
        content: content.to_string(),
        created_at: Some(Utc.with_ymd_and_hms(2024, 10, 3, 12, 0, 0).unwrap()),
        fields,
        parent_doc_id: None,
    }
}

// S1 — idempotent email ingestion: re-ingesting the same document produces
// no additional chunks, entities, or edges; PERSON nodes carry exactly one
// SENT/RECEIVED edge each to the chunk node at the document's timestamp.
#[tokio::test]
async fn idempotent_email_ingestion() {
    let dir = TempDir::new().unwrap();
    let (cfg, pool) = fresh_pool(&dir).await;

    let embedding_provider = embedding::create_provider(&cfg.embedding).unwrap();
    let llm_provider = llm::create_extraction_provider(&cfg.llm).unwrap();
    let record = email_record(
        "email-1",
        "PO 7020 update",
        "Hi John, PO 7020 shipped 2024-10-03.",
        "a@x.com",
        &["b@y.com"],
    );

    let results = ingest::ingest_batch(&pool, &cfg, embedding_provider.as_ref(), llm_provider.as_ref(), vec![record.clone()]).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunks_written, 1);

    let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind("email-1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunk_count, 1);

    let sender_id = Entity::derive_id("PERSON", "a@x.com");
    let recipient_id = Entity::derive_id("PERSON", "b@y.com");

    for (entity_id, edge_type) in [(&sender_id, "SENT"), (&recipient_id, "RECEIVED")] {
        let edge_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sent_received_edges WHERE person_entity_id = ? AND edge_type = ?",
        )
        .bind(entity_id)
        .bind(edge_type)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(edge_count, 1, "expected exactly one {edge_type} edge for {entity_id}");
    }

    let chunk_ts: Option<i64> = sqlx::query_scalar("SELECT created_at_timestamp FROM chunk_nodes WHERE document_id = ?")
        .bind("email-1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunk_ts, Some(1_727_956_800));

    // Re-ingest the identical record; nothing should duplicate.
    let results2 = ingest::ingest_batch(&pool, &cfg, embedding_provider.as_ref(), llm_provider.as_ref(), vec![record]).await;
    assert_eq!(results2.len(), 1);

    let chunk_count2: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind("email-1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunk_count2, 1, "re-ingestion must not duplicate chunks");

    let entity_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities").fetch_one(&pool).await.unwrap();
    assert_eq!(entity_total, 2, "re-ingestion must not duplicate entities");

    for (entity_id, edge_type) in [(&sender_id, "SENT"), (&recipient_id, "RECEIVED")] {
        let edge_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sent_received_edges WHERE person_entity_id = ? AND edge_type = ?",
        )
        .bind(entity_id)
        .bind(edge_type)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(edge_count, 1, "re-ingestion must not duplicate {edge_type} edges");
    }

    pool.close().await;
}

// S1 (graph side) — re-upserting an already-stored relation must not
// inflate `relationship_count` on its endpoints: that count is re-read by
// the dedup engine's primary-selection rule (§4.5) and any drift there
// would make dedup outcomes depend on how many times a document was
// re-ingested rather than on the data itself.
#[tokio::test]
async fn relation_upsert_is_idempotent_for_relationship_count() {
    let dir = TempDir::new().unwrap();
    let (_cfg, pool) = fresh_pool(&dir).await;

    let source = Entity {
        entity_id: Entity::derive_id("PERSON", "Jane Doe"),
        label: "PERSON".to_string(),
        name: "Jane Doe".to_string(),
        properties: Default::default(),
        embedding: None,
        created_at_timestamp: None,
    };
    let target = Entity {
        entity_id: Entity::derive_id("COMPANY", "Acme Corp"),
        label: "COMPANY".to_string(),
        name: "Acme Corp".to_string(),
        properties: Default::default(),
        embedding: None,
        created_at_timestamp: None,
    };
    graph::upsert_entity(&pool, &source).await.unwrap();
    graph::upsert_entity(&pool, &target).await.unwrap();

    let relation = synapse_core::models::Relation {
        source_id: source.entity_id.clone(),
        source_label: "PERSON".to_string(),
        relation_label: "WORKS_FOR".to_string(),
        target_id: target.entity_id.clone(),
        target_label: "COMPANY".to_string(),
    };

    // Simulates the same relation being re-extracted on a second identical
    // ingestion pass.
    assert!(graph::upsert_relation(&pool, &relation).await.unwrap());
    assert!(graph::upsert_relation(&pool, &relation).await.unwrap());

    let relation_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relations WHERE source_id = ? AND target_id = ?")
        .bind(&source.entity_id)
        .bind(&target.entity_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(relation_count, 1, "the relation row must not duplicate");

    for entity_id in [&source.entity_id, &target.entity_id] {
        let count: i64 = sqlx::query_scalar("SELECT relationship_count FROM entities WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1, "relationship_count must not inflate on a re-ingested relation");
    }

    pool.close().await;
}

// S2 — entity dedup merges near-duplicate PERSON nodes: the older
// (null-timestamp) node's relationship survives, the merged timestamp is
// the oldest non-null value in the cluster, and exactly one merge occurs.
#[tokio::test]
async fn dedup_merges_near_duplicate_entities() {
    let dir = TempDir::new().unwrap();
    let (cfg, pool) = fresh_pool(&dir).await;

    let old = Entity {
        entity_id: "tony-old".to_string(),
        label: "PERSON".to_string(),
        name: "Tony Codet".to_string(),
        properties: Default::default(),
        embedding: Some(vec![1.0, 0.0, 0.0]),
        created_at_timestamp: None,
    };
    let new = Entity {
        entity_id: "tony-new".to_string(),
        label: "PERSON".to_string(),
        name: "tony codet".to_string(),
        properties: Default::default(),
        embedding: Some(vec![0.999, 0.001, 0.0]),
        created_at_timestamp: Some(Utc::now().timestamp()),
    };
    graph::upsert_entity(&pool, &old).await.unwrap();
    graph::upsert_entity(&pool, &new).await.unwrap();

    // Give the older node a relationship so it is chosen as the merge primary.
    sqlx::query(
        "INSERT INTO relations (source_id, source_label, relation_label, target_id, target_label) VALUES (?, 'PERSON', 'WORKS_FOR', 'acme', 'COMPANY')",
    )
    .bind(&old.entity_id)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("UPDATE entities SET relationship_count = 1 WHERE entity_id = ?")
        .bind(&old.entity_id)
        .execute(&pool)
        .await
        .unwrap();

    let embedding_provider = embedding::create_provider(&cfg.embedding).unwrap();
    let outcome = dedup::run_dedup(&pool, embedding_provider.as_ref(), &cfg.embedding, &cfg.dedup, false)
        .await
        .unwrap();

    assert_eq!(outcome.entities_merged, 1);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities").fetch_one(&pool).await.unwrap();
    assert_eq!(remaining, 1, "exactly one PERSON node should remain");

    let surviving_id: String = sqlx::query_scalar("SELECT entity_id FROM entities").fetch_one(&pool).await.unwrap();
    let relation_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relations WHERE source_id = ? OR target_id = ?")
        .bind(&surviving_id)
        .bind(&surviving_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(relation_count, 1, "the merged node must carry the prior relationship");

    let merged_ts: Option<i64> = sqlx::query_scalar("SELECT created_at_timestamp FROM entities WHERE entity_id = ?")
        .bind(&surviving_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(merged_ts, new.created_at_timestamp, "merged timestamp is the oldest non-null value in the cluster");

    pool.close().await;
}

// S3 — a strict time-window metadata filter excludes documents outside
// the window at the store layer, never as a post-hoc filter.
#[tokio::test]
async fn time_window_filter_excludes_out_of_range_documents() {
    let dir = TempDir::new().unwrap();
    let (_cfg, pool) = fresh_pool(&dir).await;

    let dated = [
        ("doc-sep", "2024-09-15T00:00:00Z"),
        ("doc-oct", "2024-10-10T00:00:00Z"),
        ("doc-nov", "2024-11-05T00:00:00Z"),
    ];

    for (doc_id, iso) in dated {
        let created_at = iso.parse::<chrono::DateTime<Utc>>().unwrap();
        let ts = created_at.timestamp();
        sqlx::query(
            "INSERT INTO documents (id, tenant_id, source, source_id, document_type, title, content, created_at, created_at_timestamp, content_hash) VALUES (?, 'T', 'mail', ?, 'email', 'subject', 'shipment details', ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(doc_id)
        .bind(ts)
        .bind(ts)
        .bind(format!("hash-{doc_id}"))
        .execute(&pool)
        .await
        .unwrap();

        let chunks = chunk::chunk_text(doc_id, "shipment details", 700, 80, "T", "mail", "email", "subject", Some(created_at), Some(ts));
        // A fixed unit vector stands in for a real embedding; cosine
        // similarity against itself is what matters, not its content.
        let vectors: Vec<Vec<f32>> = chunks.iter().map(|_| vec![1.0, 0.0, 0.0]).collect();
        vectorstore::upsert_chunks(&pool, doc_id, &chunks, &vectors).await.unwrap();
    }

    let start = "2024-10-01T00:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap().timestamp();
    let end = "2024-10-31T23:59:59Z".parse::<chrono::DateTime<Utc>>().unwrap().timestamp();

    let hits = vectorstore::search(
        &pool,
        "T",
        &[1.0, 0.0, 0.0],
        &[
            vectorstore::Filter::Gte("created_at_timestamp".to_string(), start),
            vectorstore::Filter::Lte("created_at_timestamp".to_string(), end),
        ],
        20,
    )
    .await
    .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "doc-oct");

    pool.close().await;
}

// S5 — the relationship validator resolves any failure (here, an always-
// erroring disabled LLM provider) to rejection, never acceptance.
#[tokio::test]
async fn validator_rejects_on_llm_failure() {
    let llm_config = synapse_core::config::LlmConfig::default();
    let extraction_config = synapse_core::config::ExtractionConfig {
        enable_relationship_validation: true,
        ..Default::default()
    };
    let provider = llm::create_extraction_provider(&llm_config).unwrap();

    let candidate = CandidateTriple {
        source_label: "PERSON".to_string(),
        source_name: "John".to_string(),
        relation_label: "WORKS_FOR".to_string(),
        target_label: "COMPANY".to_string(),
        target_name: "Superior Mold".to_string(),
    };

    let text = "John from Acme called about Superior Mold's shipment.";
    let accepted = validator::validate(provider.as_ref(), &llm_config, &extraction_config, text, vec![candidate]).await;

    assert!(accepted.is_empty(), "a validator failure must resolve to rejection, not acceptance");
}

// S6 — untimed hybrid query: no time keyword means no time filter is
// applied, and graph retrieval surfaces a MATERIAL entity via keyword
// lookup and two-hop expansion, without any extraction/synthesis LLM call.
#[tokio::test]
async fn untimed_query_routes_through_graph_and_vector_tools() {
    let dir = TempDir::new().unwrap();
    let (cfg, pool) = fresh_pool(&dir).await;

    let material = Entity {
        entity_id: Entity::derive_id("MATERIAL", "Epoxy Resin"),
        label: "MATERIAL".to_string(),
        name: "Epoxy Resin".to_string(),
        properties: Default::default(),
        embedding: None,
        created_at_timestamp: None,
    };
    graph::upsert_entity(&pool, &material).await.unwrap();

    let chunk_node = synapse_core::models::ChunkNode {
        chunk_id: "chunk-1".to_string(),
        document_id: "doc-1".to_string(),
        text: "We use Epoxy Resin for all structural joints.".to_string(),
        title: "Materials memo".to_string(),
        source: "drive".to_string(),
        document_type: "memo".to_string(),
        created_at: None,
        created_at_timestamp: None,
    };
    graph::upsert_chunk_node(&pool, &chunk_node).await.unwrap();
    graph::add_mentions_edge(&pool, &chunk_node.chunk_id, &material.entity_id).await.unwrap();

    let embedding_provider = embedding::create_provider(&cfg.embedding).unwrap();
    let llm_provider = llm::create_query_provider(&cfg.llm).unwrap();
    let reranker = rerank::create_reranker(&cfg.rerank);

    let response = query::query(
        &pool,
        &cfg,
        embedding_provider.as_ref(),
        llm_provider.as_ref(),
        reranker.as_ref(),
        "T",
        "what epoxy resin do we use?",
    )
    .await
    .unwrap();

    assert!(!response.metadata.is_time_filtered);
    assert!(response.metadata.start_timestamp.is_none());
    assert!(response.answer.to_lowercase().contains("epoxy"), "answer: {}", response.answer);
    assert!(
        response.source_nodes.iter().any(|n| n.excerpt.to_lowercase().contains("epoxy")),
        "expected a source node referencing the material"
    );

    pool.close().await;
}

// The extractor's quality threshold and schema context are exercised at
// the unit level in `extract.rs`; here we confirm the disabled-provider
// path the ingestion pipeline takes when no LLM is configured never
// touches the network and simply skips graph extraction.
#[tokio::test]
async fn extraction_is_skipped_when_llm_disabled() {
    let llm_config = synapse_core::config::LlmConfig::default();
    let extraction_config = synapse_core::config::ExtractionConfig::default();
    let provider = llm::create_extraction_provider(&llm_config).unwrap();

    let result = extract::extract(provider.as_ref(), &llm_config, &extraction_config, "irrelevant text", &[]).await;
    assert!(result.is_err(), "a disabled provider must not silently succeed");
}
