//! Entity deduplication engine (§4.5).
//!
//! Runs periodically (driven by `scheduler.rs`) and on demand. Candidate
//! generation blends vector similarity (`embedding::cosine_similarity`)
//! with string distance (`strsim::levenshtein`); clustering is a simple
//! union-find over admitted neighbour pairs so that chains of near-
//! duplicates (A~B, B~C) merge into one cluster even if A and C alone
//! would not be admitted.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::DedupConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};

#[derive(Debug, Clone)]
struct EntityRow {
    internal_id: i64,
    entity_id: String,
    label: String,
    name: String,
    properties: serde_json::Value,
    embedding: Option<Vec<f32>>,
    created_at_timestamp: Option<i64>,
    relationship_count: i64,
}

/// Outcome of a `run_dedup` invocation (§6 `run_dedup` contract).
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupOutcome {
    pub duplicates_found: usize,
    pub entities_merged: usize,
    pub clusters_skipped: usize,
    pub embeddings_regenerated: usize,
}

struct UnionFind {
    parent: HashMap<i64, i64>,
}

impl UnionFind {
    fn new(ids: impl Iterator<Item = i64>) -> Self {
        let parent = ids.map(|id| (id, id)).collect();
        Self { parent }
    }

    fn find(&mut self, x: i64) -> i64 {
        let p = *self.parent.get(&x).unwrap_or(&x);
        if p == x {
            x
        } else {
            let root = self.find(p);
            self.parent.insert(x, root);
            root
        }
    }

    fn union(&mut self, a: i64, b: i64) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Merge into the lower id so cluster ids stay stable across runs.
            let (keep, drop) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(drop, keep);
        }
    }
}

async fn fetch_entities(pool: &SqlitePool) -> Result<Vec<EntityRow>> {
    let rows = sqlx::query(
        "SELECT internal_id, entity_id, label, name, properties_json, embedding, created_at_timestamp, relationship_count FROM entities",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let embedding_blob: Option<Vec<u8>> = r.get("embedding");
            let properties_json: String = r.get("properties_json");
            EntityRow {
                internal_id: r.get("internal_id"),
                entity_id: r.get("entity_id"),
                label: r.get("label"),
                name: r.get("name"),
                properties: serde_json::from_str(&properties_json).unwrap_or_default(),
                embedding: embedding_blob.map(|b| blob_to_vec(&b)),
                created_at_timestamp: r.get("created_at_timestamp"),
                relationship_count: r.get("relationship_count"),
            }
        })
        .collect())
}

fn is_candidate(entity: &EntityRow, now: i64, hours_lookback: Option<i64>) -> bool {
    if entity.embedding.is_none() {
        return false;
    }
    match (hours_lookback, entity.created_at_timestamp) {
        (None, _) => true,
        (Some(_), None) => true, // legacy entities always included
        (Some(hours), Some(ts)) => ts >= now - hours * 3600,
    }
}

fn names_match(a: &str, b: &str, max_string_distance: usize) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    if a.contains(&b) || b.contains(&a) {
        return true;
    }
    strsim::levenshtein(&a, &b) <= max_string_distance
}

/// Builds the admitted-neighbour edge set: for every candidate entity,
/// its top-`top_k` nearest neighbours (by cosine similarity) across the
/// *entire* entity index, filtered by the similarity and string-distance
/// gate (§4.5 steps 1-3).
fn build_edges(entities: &[EntityRow], config: &DedupConfig, now: i64) -> Vec<(i64, i64)> {
    let candidates: Vec<&EntityRow> = entities
        .iter()
        .filter(|e| is_candidate(e, now, config.hours_lookback))
        .collect();

    let mut edges = Vec::new();

    for candidate in &candidates {
        let emb = candidate.embedding.as_ref().unwrap();
        let mut scored: Vec<(f32, &EntityRow)> = entities
            .iter()
            .filter(|other| other.internal_id != candidate.internal_id && other.embedding.is_some())
            .map(|other| (cosine_similarity(emb, other.embedding.as_ref().unwrap()), other))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(config.top_k.max(0) as usize);

        for (score, neighbor) in scored {
            if score >= config.similarity_threshold
                && names_match(&candidate.name, &neighbor.name, config.max_string_distance)
            {
                edges.push((candidate.internal_id, neighbor.internal_id));
            }
        }
    }

    edges
}

fn cluster_entities(entities: &[EntityRow], config: &DedupConfig, now: i64) -> Vec<Vec<i64>> {
    let edges = build_edges(entities, config, now);
    let mut uf = UnionFind::new(entities.iter().map(|e| e.internal_id));
    for (a, b) in &edges {
        uf.union(*a, *b);
    }

    let mut groups: HashMap<i64, Vec<i64>> = HashMap::new();
    for entity in entities {
        let root = uf.find(entity.internal_id);
        groups.entry(root).or_default().push(entity.internal_id);
    }

    groups.into_values().filter(|g| g.len() > 1).collect()
}

/// Merges one cluster inside a fresh transaction. Returns `true` if the
/// merge committed (or would have, under `dry_run`), `false` if this
/// cluster's merge was skipped due to an error — the caller continues to
/// the next cluster either way.
async fn merge_cluster(
    pool: &SqlitePool,
    cluster_internal_ids: &[i64],
    provider: &dyn EmbeddingProvider,
    embedding_config: &crate::config::EmbeddingConfig,
    dry_run: bool,
    embeddings_regenerated: &mut usize,
) -> Result<usize> {
    let mut tx = pool.begin().await?;

    let mut members = Vec::with_capacity(cluster_internal_ids.len());
    for id in cluster_internal_ids {
        let row = sqlx::query(
            "SELECT internal_id, entity_id, label, name, properties_json, embedding, created_at_timestamp, relationship_count FROM entities WHERE internal_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let embedding_blob: Option<Vec<u8>> = row.get("embedding");
        let properties_json: String = row.get("properties_json");
        members.push(EntityRow {
            internal_id: row.get("internal_id"),
            entity_id: row.get("entity_id"),
            label: row.get("label"),
            name: row.get("name"),
            properties: serde_json::from_str(&properties_json).unwrap_or_default(),
            embedding: embedding_blob.map(|b| blob_to_vec(&b)),
            created_at_timestamp: row.get("created_at_timestamp"),
            relationship_count: row.get("relationship_count"),
        });
    }

    // Primary: highest relationship_count, ties broken by lowest internal_id.
    let primary = members
        .iter()
        .max_by(|a, b| {
            a.relationship_count
                .cmp(&b.relationship_count)
                .then(b.internal_id.cmp(&a.internal_id))
        })
        .cloned()
        .expect("cluster is non-empty");

    let non_primary: Vec<&EntityRow> = members.iter().filter(|m| m.internal_id != primary.internal_id).collect();

    let oldest_timestamp = members.iter().filter_map(|m| m.created_at_timestamp).min();

    let mut merged_properties = serde_json::Map::new();
    for other in &non_primary {
        if let Some(obj) = other.properties.as_object() {
            for (k, v) in obj {
                merged_properties.insert(k.clone(), v.clone());
            }
        }
    }
    if let Some(obj) = primary.properties.as_object() {
        for (k, v) in obj {
            merged_properties.insert(k.clone(), v.clone());
        }
    }

    for other in &non_primary {
        // Re-point relations, deduping against the unique constraint.
        let source_rels = sqlx::query(
            "SELECT relation_label, target_id, target_label FROM relations WHERE source_id = ?",
        )
        .bind(&other.entity_id)
        .fetch_all(&mut *tx)
        .await?;
        for r in source_rels {
            let relation_label: String = r.get("relation_label");
            let target_id: String = r.get("target_id");
            let target_label: String = r.get("target_label");
            sqlx::query(
                "INSERT OR IGNORE INTO relations (source_id, source_label, relation_label, target_id, target_label) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&primary.entity_id)
            .bind(&primary.label)
            .bind(&relation_label)
            .bind(&target_id)
            .bind(&target_label)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM relations WHERE source_id = ?")
            .bind(&other.entity_id)
            .execute(&mut *tx)
            .await?;

        let target_rels = sqlx::query(
            "SELECT source_id, source_label, relation_label FROM relations WHERE target_id = ?",
        )
        .bind(&other.entity_id)
        .fetch_all(&mut *tx)
        .await?;
        for r in target_rels {
            let source_id: String = r.get("source_id");
            let source_label: String = r.get("source_label");
            let relation_label: String = r.get("relation_label");
            sqlx::query(
                "INSERT OR IGNORE INTO relations (source_id, source_label, relation_label, target_id, target_label) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&source_id)
            .bind(&source_label)
            .bind(&relation_label)
            .bind(&primary.entity_id)
            .bind(&primary.label)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM relations WHERE target_id = ?")
            .bind(&other.entity_id)
            .execute(&mut *tx)
            .await?;

        let mention_chunks: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM mentions_edges WHERE entity_id = ?")
                .bind(&other.entity_id)
                .fetch_all(&mut *tx)
                .await?;
        for chunk_id in mention_chunks {
            sqlx::query("INSERT OR IGNORE INTO mentions_edges (chunk_id, entity_id) VALUES (?, ?)")
                .bind(&chunk_id)
                .bind(&primary.entity_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM mentions_edges WHERE entity_id = ?")
            .bind(&other.entity_id)
            .execute(&mut *tx)
            .await?;

        let sent_received: Vec<(String, String)> = sqlx::query(
            "SELECT chunk_id, edge_type FROM sent_received_edges WHERE person_entity_id = ?",
        )
        .bind(&other.entity_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| (r.get("chunk_id"), r.get("edge_type")))
        .collect();
        for (chunk_id, edge_type) in sent_received {
            sqlx::query(
                "INSERT OR IGNORE INTO sent_received_edges (person_entity_id, chunk_id, edge_type) VALUES (?, ?, ?)",
            )
            .bind(&primary.entity_id)
            .bind(&chunk_id)
            .bind(&edge_type)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM sent_received_edges WHERE person_entity_id = ?")
            .bind(&other.entity_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM entities WHERE entity_id = ?")
            .bind(&other.entity_id)
            .execute(&mut *tx)
            .await?;
    }

    let relationship_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM relations WHERE source_id = ? OR target_id = ?",
    )
    .bind(&primary.entity_id)
    .bind(&primary.entity_id)
    .fetch_one(&mut *tx)
    .await?;

    let mut final_embedding = primary.embedding.clone();
    if final_embedding.as_ref().map(|e| e.is_empty()).unwrap_or(true) {
        let embedding_text = format!("{}: {}", primary.label, primary.name);
        let fresh = crate::embedding::embed_texts(provider, embedding_config, &[embedding_text]).await?;
        final_embedding = fresh.into_iter().next();
        *embeddings_regenerated += 1;
    }

    sqlx::query(
        "UPDATE entities SET properties_json = ?, created_at_timestamp = ?, relationship_count = ?, embedding = COALESCE(?, embedding) WHERE entity_id = ?",
    )
    .bind(serde_json::Value::Object(merged_properties).to_string())
    .bind(oldest_timestamp)
    .bind(relationship_count)
    .bind(final_embedding.map(|e| vec_to_blob(&e)))
    .bind(&primary.entity_id)
    .execute(&mut *tx)
    .await?;

    if dry_run {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }

    Ok(non_primary.len())
}

/// Runs the dedup engine once (§4.5). `dry_run` computes the same plan but
/// rolls back every cluster's transaction, satisfying testable property 7.
pub async fn run_dedup(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    embedding_config: &crate::config::EmbeddingConfig,
    dedup_config: &DedupConfig,
    dry_run: bool,
) -> Result<DedupOutcome> {
    let now = chrono::Utc::now().timestamp();
    let entities = fetch_entities(pool).await?;
    let clusters = cluster_entities(&entities, dedup_config, now);

    let mut outcome = DedupOutcome {
        duplicates_found: clusters.len(),
        ..Default::default()
    };

    for batch in clusters.chunks(dedup_config.batch_size.max(1)) {
        for cluster in batch {
            match merge_cluster(
                pool,
                cluster,
                provider,
                embedding_config,
                dry_run,
                &mut outcome.embeddings_regenerated,
            )
            .await
            {
                Ok(merged_count) => outcome.entities_merged += merged_count,
                Err(e) => {
                    warn!(error = %e, "dedup: cluster merge failed, skipping");
                    outcome.clusters_skipped += 1;
                }
            }
        }
    }

    if outcome.entities_merged > dedup_config.merge_guard_threshold {
        warn!(
            merged = outcome.entities_merged,
            threshold = dedup_config.merge_guard_threshold,
            "dedup: merge count exceeded guard threshold, check similarity_threshold"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(internal_id: i64, name: &str, embedding: Vec<f32>, ts: Option<i64>, rel_count: i64) -> EntityRow {
        EntityRow {
            internal_id,
            entity_id: format!("e{}", internal_id),
            label: "PERSON".to_string(),
            name: name.to_string(),
            properties: serde_json::json!({}),
            embedding: Some(embedding),
            created_at_timestamp: ts,
            relationship_count: rel_count,
        }
    }

    fn default_config() -> DedupConfig {
        DedupConfig {
            enabled: true,
            interval_minutes: 15,
            similarity_threshold: 0.92,
            max_string_distance: 3,
            hours_lookback: Some(24),
            top_k: 10,
            merge_guard_threshold: 100,
            batch_size: 10,
        }
    }

    #[test]
    fn clusters_near_duplicate_names() {
        let now = 1_700_000_000;
        let entities = vec![
            entity(1, "Tony Codet", vec![1.0, 0.0, 0.0], None, 3),
            entity(2, "tony codet", vec![0.999, 0.001, 0.0], Some(now), 1),
        ];
        let clusters = cluster_entities(&entities, &default_config(), now);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn does_not_cluster_dissimilar_entities() {
        let now = 1_700_000_000;
        let entities = vec![
            entity(1, "Tony Codet", vec![1.0, 0.0, 0.0], None, 0),
            entity(2, "Superior Mold", vec![0.0, 1.0, 0.0], Some(now), 0),
        ];
        let clusters = cluster_entities(&entities, &default_config(), now);
        assert!(clusters.is_empty());
    }

    #[test]
    fn legacy_null_timestamp_always_a_candidate() {
        let entity_row = entity(1, "Legacy", vec![1.0, 0.0], None, 0);
        assert!(is_candidate(&entity_row, 1_700_000_000, Some(24)));
    }

    #[test]
    fn full_scan_when_lookback_none() {
        let old = entity(1, "Old", vec![1.0], Some(0), 0);
        assert!(is_candidate(&old, 1_700_000_000, None));
    }
}
