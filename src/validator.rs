//! Relationship validator (§4.3).
//!
//! Poses a strict yes/no question per candidate relation to the
//! extraction LLM at temperature 0, passing only a bounded prefix of the
//! chunk text. Errors resolve to rejection — never to acceptance — and
//! the candidate triples are never mutated, only filtered.

use crate::config::{ExtractionConfig, LlmConfig};
use crate::llm::LlmProvider;
use crate::models::CandidateTriple;

fn prefix(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn build_question(candidate: &CandidateTriple) -> String {
    format!(
        "Does the text explicitly support: {} -[{}]-> {}? Answer only YES or NO.",
        candidate.source_name, candidate.relation_label, candidate.target_name
    )
}

/// Validates a single candidate against `chunk_text`; errors (unparseable
/// response, LLM failure) resolve to `false` — the expected-path rejection
/// named in §4.3/§7 `ValidationError`.
async fn validate_one(
    provider: &dyn LlmProvider,
    llm_config: &LlmConfig,
    validator_prefix_chars: usize,
    chunk_text: &str,
    candidate: &CandidateTriple,
) -> bool {
    let system_prompt =
        "You answer strictly YES or NO to questions about whether a relationship is explicitly supported by the given text. Respond with only the single word YES or NO.";
    let user_prompt = format!(
        "Text: \"{}\"\n\n{}",
        prefix(chunk_text, validator_prefix_chars),
        build_question(candidate)
    );

    match crate::llm::complete(provider, llm_config, system_prompt, &user_prompt, false).await {
        Ok(answer) => answer.trim().to_uppercase().starts_with("YES"),
        Err(_) => false,
    }
}

/// Filters `candidates` down to those the validator confirms are
/// explicitly supported by `chunk_text`. When validation is disabled
/// (`enable_relationship_validation = false`), all candidates pass
/// through unchanged.
pub async fn validate(
    provider: &dyn LlmProvider,
    llm_config: &LlmConfig,
    extraction_config: &ExtractionConfig,
    chunk_text: &str,
    candidates: Vec<CandidateTriple>,
) -> Vec<CandidateTriple> {
    if !extraction_config.enable_relationship_validation {
        return candidates;
    }

    let mut accepted = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if validate_one(
            provider,
            llm_config,
            extraction_config.validator_prefix_chars,
            chunk_text,
            &candidate,
        )
        .await
        {
            accepted.push(candidate);
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_respects_bound() {
        let text = "x".repeat(1000);
        assert_eq!(prefix(&text, 500).chars().count(), 500);
    }

    #[test]
    fn question_names_source_relation_target() {
        let candidate = CandidateTriple {
            source_label: "PERSON".to_string(),
            source_name: "John".to_string(),
            relation_label: "WORKS_FOR".to_string(),
            target_label: "COMPANY".to_string(),
            target_name: "Acme".to_string(),
        };
        let q = build_question(&candidate);
        assert!(q.contains("John"));
        assert!(q.contains("WORKS_FOR"));
        assert!(q.contains("Acme"));
    }
}
