//! Cross-encoder reranker (§4.6 step 4).
//!
//! Defines the reranker trait the query engine calls optionally after
//! recency boosting. No cross-encoder model ships with this crate (none
//! of the external stores are wired up by default), so the provided
//! implementation is a deterministic lexical-overlap heuristic that keeps
//! the `Reranker` seam usable without a GPU/CPU model dependency; a real
//! cross-encoder can be dropped in behind the same trait.

use std::collections::HashSet;

use crate::vectorstore::VectorHit;

pub trait Reranker: Send + Sync {
    /// Reorders `hits` by relevance to `question` and truncates to
    /// `top_n`. Must be a pure reordering/truncation — it must not alter
    /// any hit's content.
    fn rerank(&self, question: &str, hits: Vec<VectorHit>, top_n: usize) -> Vec<VectorHit>;
}

/// Builds the configured reranker. Only `"heuristic"` ships today; unknown
/// provider names fall back to it rather than failing query startup.
pub fn create_reranker(_config: &crate::config::RerankConfig) -> Box<dyn Reranker> {
    Box::new(HeuristicReranker)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Scores each hit by Jaccard token overlap with the question, blended
/// with its existing (recency-boosted) similarity score so a reranker
/// with no model available still produces a stable, deterministic order.
pub struct HeuristicReranker;

impl Reranker for HeuristicReranker {
    fn rerank(&self, question: &str, mut hits: Vec<VectorHit>, top_n: usize) -> Vec<VectorHit> {
        let q_tokens = tokenize(question);
        if q_tokens.is_empty() {
            hits.truncate(top_n);
            return hits;
        }

        let mut scored: Vec<(f32, VectorHit)> = hits
            .drain(..)
            .map(|hit| {
                let hit_tokens = tokenize(&hit.text);
                let overlap = q_tokens.intersection(&hit_tokens).count() as f32;
                let union = q_tokens.union(&hit_tokens).count().max(1) as f32;
                let jaccard = overlap / union;
                let blended = 0.5 * jaccard + 0.5 * hit.score;
                (blended, hit)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_n);
        scored.into_iter().map(|(_, hit)| hit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, text: &str, score: f32) -> VectorHit {
        VectorHit {
            chunk_id: chunk_id.to_string(),
            document_id: "doc".to_string(),
            text: text.to_string(),
            title: "title".to_string(),
            source: "mail".to_string(),
            document_type: "email".to_string(),
            created_at_timestamp: None,
            score,
        }
    }

    #[test]
    fn prefers_lexical_overlap() {
        let hits = vec![
            hit("a", "the quick brown fox", 0.1),
            hit("b", "materials and shipment details", 0.1),
        ];
        let reranker = HeuristicReranker;
        let reranked = reranker.rerank("what materials do we use", hits, 2);
        assert_eq!(reranked[0].chunk_id, "b");
    }

    #[test]
    fn truncates_to_top_n() {
        let hits = vec![hit("a", "x", 0.9), hit("b", "y", 0.8), hit("c", "z", 0.7)];
        let reranker = HeuristicReranker;
        let reranked = reranker.rerank("irrelevant question text", hits, 2);
        assert_eq!(reranked.len(), 2);
    }
}
