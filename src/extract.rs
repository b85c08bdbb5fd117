//! Schema-guided entity/relation extractor (§4.2).
//!
//! Given a chunk's content-only text, asks the extraction LLM for a
//! bounded set of `(entity, relation, entity)` triples restricted to the
//! closed label sets declared in `relation_schema`, then locally enforces
//! the bound, the schema, a quality threshold on entity names, and
//! per-chunk entity dedup — the extractor never trusts the model to have
//! honored these itself.

use std::collections::HashSet;

use anyhow::Result;

use crate::config::{ExtractionConfig, LlmConfig};
use crate::llm::LlmProvider;
use crate::models::{CandidateTriple, Entity};

const GENERIC_NAMES: &[&str] = &["it", "this", "that", "he", "she", "they", "them", "someone", "something"];

/// Truncates `text` to `budget` characters, the extractor's context-budget
/// guard (§4.2: truncate rather than fail).
fn truncate_to_budget(text: &str, budget: usize) -> String {
    text.chars().take(budget).collect()
}

/// Rejects generic/low-quality entity names: too short, or a closed-class
/// pronoun/placeholder (§4.2 quality threshold).
fn passes_quality_threshold(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.chars().count() < 2 {
        return false;
    }
    !GENERIC_NAMES.contains(&trimmed.to_lowercase().as_str())
}

fn build_system_prompt(schema: &[(String, String, String)]) -> String {
    let mut labels: HashSet<&str> = HashSet::new();
    for (s, _, t) in schema {
        labels.insert(s.as_str());
        labels.insert(t.as_str());
    }
    let mut label_list: Vec<&str> = labels.into_iter().collect();
    label_list.sort_unstable();

    let schema_lines: Vec<String> = schema
        .iter()
        .map(|(s, r, t)| format!("- {} -[{}]-> {}", s, r, t))
        .collect();

    format!(
        "You extract structured (entity, relation, entity) triples from text.\n\
         Entity labels are restricted to: {}.\n\
         Relations must match one of these patterns exactly:\n{}\n\
         Respond with JSON only: {{\"triples\": [{{\"source_label\": ..., \"source_name\": ..., \"relation_label\": ..., \"target_label\": ..., \"target_name\": ...}}]}}.\n\
         Use only explicit, named entities from the text. Do not invent facts.",
        label_list.join(", "),
        schema_lines.join("\n"),
    )
}

/// Output of a single chunk's extraction pass: entities deduped by
/// `(label, name)` within the chunk, and the candidate triples referencing
/// them, both already schema- and quality-filtered and capped at
/// `max_triplets_per_chunk`.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub candidates: Vec<CandidateTriple>,
}

/// Extracts triples from `chunk_text` (content-only — no document
/// metadata, per §4.2) against the closed `relation_schema`.
pub async fn extract(
    provider: &dyn LlmProvider,
    llm_config: &LlmConfig,
    extraction_config: &ExtractionConfig,
    chunk_text: &str,
    relation_schema: &[(String, String, String)],
) -> Result<ExtractionResult> {
    let truncated = truncate_to_budget(chunk_text, extraction_config.context_budget_chars);
    let system_prompt = build_system_prompt(relation_schema);

    let raw = crate::llm::complete(provider, llm_config, &system_prompt, &truncated, true).await?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("extractor returned unparseable JSON: {}", e))?;

    let triples = parsed
        .get("triples")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();

    let schema_set: HashSet<(String, String, String)> = relation_schema.iter().cloned().collect();

    let mut entities_seen: HashSet<(String, String)> = HashSet::new();
    let mut entities = Vec::new();
    let mut candidates = Vec::new();

    for triple in triples {
        if candidates.len() >= extraction_config.max_triplets_per_chunk {
            break;
        }

        let source_label = triple.get("source_label").and_then(|v| v.as_str()).unwrap_or_default();
        let source_name = triple.get("source_name").and_then(|v| v.as_str()).unwrap_or_default();
        let relation_label = triple.get("relation_label").and_then(|v| v.as_str()).unwrap_or_default();
        let target_label = triple.get("target_label").and_then(|v| v.as_str()).unwrap_or_default();
        let target_name = triple.get("target_name").and_then(|v| v.as_str()).unwrap_or_default();

        if !passes_quality_threshold(source_name) || !passes_quality_threshold(target_name) {
            continue;
        }

        let key = (
            source_label.to_string(),
            relation_label.to_string(),
            target_label.to_string(),
        );
        if !schema_set.contains(&key) {
            continue;
        }

        for (label, name) in [(source_label, source_name), (target_label, target_name)] {
            let dedup_key = (label.to_string(), name.trim().to_lowercase());
            if entities_seen.insert(dedup_key) {
                let entity_id = Entity::derive_id(label, name);
                entities.push(Entity {
                    entity_id,
                    label: label.to_string(),
                    name: name.to_string(),
                    properties: Default::default(),
                    embedding: None,
                    created_at_timestamp: None,
                });
            }
        }

        candidates.push(CandidateTriple {
            source_label: source_label.to_string(),
            source_name: source_name.to_string(),
            relation_label: relation_label.to_string(),
            target_label: target_label.to_string(),
            target_name: target_name.to_string(),
        });
    }

    Ok(ExtractionResult { entities, candidates })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_threshold_rejects_generic_names() {
        assert!(!passes_quality_threshold("it"));
        assert!(!passes_quality_threshold("a"));
        assert!(passes_quality_threshold("John"));
        assert!(passes_quality_threshold("Acme Corp"));
    }

    #[test]
    fn system_prompt_lists_schema_and_labels() {
        let schema = vec![("PERSON".to_string(), "WORKS_FOR".to_string(), "COMPANY".to_string())];
        let prompt = build_system_prompt(&schema);
        assert!(prompt.contains("PERSON"));
        assert!(prompt.contains("WORKS_FOR"));
        assert!(prompt.contains("COMPANY"));
    }

    #[test]
    fn truncate_respects_budget() {
        let text = "a".repeat(100);
        assert_eq!(truncate_to_budget(&text, 10).chars().count(), 10);
    }
}
