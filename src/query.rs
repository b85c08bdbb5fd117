//! Hybrid query engine (§4.6).
//!
//! `query()` answers a natural-language question by decomposing it into
//! sub-questions, routing each to a vector or graph retrieval [`Tool`], and
//! synthesising a single compact answer; `chat()` layers token-budgeted
//! conversation history on top. Time-aware filtering runs ahead of
//! retrieval: a cheap keyword prefilter gates an LLM time-extraction call,
//! whose result becomes a strict metadata filter enforced at the store
//! layer (never a post-hoc filter on already-fetched rows).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::graph::{self, GraphHit};
use crate::llm::LlmProvider;
use crate::models::{RetrievalOrigin, SourceNode};
use crate::rerank::Reranker;
use crate::vectorstore::{self, Filter, VectorHit};

const TIME_KEYWORDS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august",
    "september", "october", "november", "december", "quarter", "q1", "q2", "q3", "q4",
    "last week", "last month", "last year", "this week", "this month", "this year",
    "after", "before", "between", "during", "since",
];

/// Cheap string scan for temporal language (§4.6 step 1). Also matches any
/// explicit 4-digit year, so an LLM call is skipped entirely for untimed
/// questions like "what materials do we use?".
fn has_time_keyword(question: &str) -> bool {
    let lower = question.to_lowercase();
    if TIME_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_digit())
        .any(|tok| tok.len() == 4 && tok.parse::<u32>().is_ok_and(|y| (1900..=2100).contains(&y)))
}

#[derive(Debug, Clone, Copy)]
struct TimeWindow {
    start_timestamp: i64,
    end_timestamp: i64,
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Calls the query-time LLM in JSON mode with the *current* date in the
/// prompt (so "last month" resolves relative to now, not training data),
/// and parses the fixed `{has_time_filter, start_date?, end_date?}` shape
/// (§4.6 step 2). Any parse or call failure degrades to "no time filter"
/// rather than failing the whole query.
async fn extract_time_window(
    provider: &dyn LlmProvider,
    llm_config: &crate::config::LlmConfig,
    question: &str,
    now: DateTime<Utc>,
) -> Option<TimeWindow> {
    if provider.model_name() == "disabled" {
        return None;
    }

    let system_prompt = format!(
        "Today's date is {}. Determine whether the user's question refers to a specific \
         time range. Respond with JSON only: either {{\"has_time_filter\": false}} or \
         {{\"has_time_filter\": true, \"start_date\": \"YYYY-MM-DD\", \"end_date\": \"YYYY-MM-DD\"}}.",
        now.format("%Y-%m-%d")
    );

    let raw = crate::llm::complete(provider, llm_config, &system_prompt, question, true)
        .await
        .ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;

    if !parsed.get("has_time_filter")?.as_bool()? {
        return None;
    }

    let start = parse_date(parsed.get("start_date")?.as_str()?)?;
    let end = parse_date(parsed.get("end_date")?.as_str()?)?;

    let start_timestamp = start.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
    let end_timestamp = end.and_hms_opt(23, 59, 59)?.and_utc().timestamp();

    Some(TimeWindow { start_timestamp, end_timestamp })
}

/// Extracts lowercase alphanumeric tokens of length >= 3 for keyword-based
/// entity lookup, the synonym retriever's input (§4.6 step 5).
fn keyword_tokens(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 3)
        .map(|s| s.to_string())
        .collect()
}

fn recency_boosted_score(score: f32, created_at_timestamp: Option<i64>, decay_days: f64, now: DateTime<Utc>) -> f64 {
    let Some(ts) = created_at_timestamp else {
        return score as f64;
    };
    let age_days = ((now.timestamp() - ts).max(0) as f64) / 86_400.0;
    let boost = 0.5f64.powf(age_days / decay_days.max(1.0));
    score as f64 * boost
}

fn vector_hit_to_source_node(hit: VectorHit, score: f64) -> SourceNode {
    SourceNode {
        document_id: hit.document_id,
        title: hit.title,
        source: hit.source,
        document_type: hit.document_type,
        created_at: hit.created_at_timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        excerpt: hit.text,
        score,
        origin: RetrievalOrigin::Vector,
    }
}

fn graph_hit_to_source_node(hit: GraphHit) -> SourceNode {
    SourceNode {
        document_id: hit.document_id,
        title: hit.title,
        source: hit.source,
        document_type: hit.document_type,
        created_at: hit.created_at_timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        excerpt: hit.text,
        score: 1.0,
        origin: RetrievalOrigin::Graph,
    }
}

/// A retrieval strategy wrapped for the sub-question engine (§4.6 step 6;
/// GLOSSARY "Tool"). Each tool answers one sub-question in isolation and
/// returns the source nodes it drew the answer from.
#[async_trait]
trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn retrieve(&self, sub_question: &str) -> Result<(String, Vec<SourceNode>)>;
}

struct QueryContext<'a> {
    pool: &'a SqlitePool,
    config: &'a Config,
    reranker: &'a dyn Reranker,
    tenant_id: String,
    query_vector: Vec<f32>,
    time_window: Option<TimeWindow>,
    now: DateTime<Utc>,
}

struct VectorTool<'a> {
    ctx: &'a QueryContext<'a>,
}

#[async_trait]
impl<'a> Tool for VectorTool<'a> {
    fn name(&self) -> &str {
        "vector"
    }

    async fn retrieve(&self, sub_question: &str) -> Result<(String, Vec<SourceNode>)> {
        let ctx = self.ctx;
        let mut filters = Vec::new();
        if let Some(window) = ctx.time_window {
            filters.push(Filter::Gte("created_at_timestamp".to_string(), window.start_timestamp));
            filters.push(Filter::Lte("created_at_timestamp".to_string(), window.end_timestamp));
        }

        let hits = vectorstore::search(
            ctx.pool,
            &ctx.tenant_id,
            &ctx.query_vector,
            &filters,
            ctx.config.retrieval.similarity_top_k,
        )
        .await?;

        let mut boosted: Vec<VectorHit> = hits;
        let mut scores: Vec<f64> = boosted
            .iter()
            .map(|h| {
                let decay = ctx.config.retrieval.decay_days_for(&h.document_type);
                recency_boosted_score(h.score, h.created_at_timestamp, decay, ctx.now)
            })
            .collect();

        // Reorder boosted/scores together by descending boosted score
        // before handing to the (pure-reordering) reranker.
        let mut indices: Vec<usize> = (0..boosted.len()).collect();
        indices.sort_by(|&i, &j| scores[j].partial_cmp(&scores[i]).unwrap_or(std::cmp::Ordering::Equal));
        boosted = indices.iter().map(|&i| boosted[i].clone()).collect();
        scores = indices.iter().map(|&i| scores[i]).collect();

        let top_n = ctx.config.retrieval.rerank_top_n.max(0) as usize;
        let reranked = if ctx.config.retrieval.enable_rerank {
            // the reranker re-scores by lexical overlap; recompute boosted
            // scores for the surviving hits by chunk_id after rerank.
            let by_chunk: std::collections::HashMap<String, f64> = boosted
                .iter()
                .zip(scores.iter())
                .map(|(h, s)| (h.chunk_id.clone(), *s))
                .collect();
            let reranked_hits = ctx.reranker.rerank(sub_question, boosted, top_n);
            reranked_hits
                .into_iter()
                .map(|h| {
                    let score = *by_chunk.get(&h.chunk_id).unwrap_or(&0.0);
                    (h, score)
                })
                .collect::<Vec<_>>()
        } else {
            boosted.into_iter().zip(scores).take(top_n).collect()
        };

        let nodes: Vec<SourceNode> = reranked
            .into_iter()
            .map(|(hit, score)| vector_hit_to_source_node(hit, score))
            .collect();

        if nodes.is_empty() {
            return Ok(("the context does not address this".to_string(), nodes));
        }

        let context: String = nodes
            .iter()
            .map(|n| format!("[{}] {}", n.title, n.excerpt))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok((context, nodes))
    }
}

struct GraphTool<'a> {
    ctx: &'a QueryContext<'a>,
}

#[async_trait]
impl<'a> Tool for GraphTool<'a> {
    fn name(&self) -> &str {
        "graph"
    }

    async fn retrieve(&self, sub_question: &str) -> Result<(String, Vec<SourceNode>)> {
        let ctx = self.ctx;

        let hits = match ctx.time_window {
            // Timed questions: templated read-only graph query restricted
            // to chunk-node timestamps (§4.6 step 5).
            Some(window) => {
                graph::query_chunk_nodes_in_window(
                    ctx.pool,
                    window.start_timestamp,
                    window.end_timestamp,
                    ctx.config.retrieval.similarity_top_k,
                )
                .await?
            }
            // Untimed questions: synonym retriever (keyword->entity) plus
            // a 2-hop neighbourhood expansion.
            None => {
                let keywords = keyword_tokens(sub_question);
                let entities = graph::find_entities_by_keywords(ctx.pool, &keywords).await?;
                let entity_ids: Vec<String> = entities.into_iter().map(|e| e.entity_id).collect();
                graph::expand_two_hops(ctx.pool, &entity_ids).await?
            }
        };

        let nodes: Vec<SourceNode> = hits.into_iter().map(graph_hit_to_source_node).collect();

        if nodes.is_empty() {
            return Ok(("the context does not address this".to_string(), nodes));
        }

        let context: String = nodes
            .iter()
            .map(|n| format!("[{}] {}", n.title, n.excerpt))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok((context, nodes))
    }
}

/// Decomposes `question` into `(sub_question, tool_name)` pairs (§4.6 step
/// 6). Without an LLM, or on any parse failure, degrades to the single
/// trivial decomposition: the whole question routed to both tools.
async fn decompose(
    provider: &dyn LlmProvider,
    llm_config: &crate::config::LlmConfig,
    question: &str,
) -> Vec<(String, &'static str)> {
    let default = vec![(question.to_string(), "vector"), (question.to_string(), "graph")];

    if provider.model_name() == "disabled" {
        return default;
    }

    let system_prompt = "Decompose the user's question into one or more independent \
         sub-questions, each routed to either the \"vector\" tool (semantic/textual \
         search) or the \"graph\" tool (entity/relationship lookup). Respond with JSON \
         only: {\"sub_questions\": [{\"question\": ..., \"tool\": \"vector\"|\"graph\"}]}.";

    let Ok(raw) = crate::llm::complete(provider, llm_config, system_prompt, question, true).await else {
        return default;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return default;
    };
    let Some(items) = parsed.get("sub_questions").and_then(|v| v.as_array()) else {
        return default;
    };

    let mut routed = Vec::new();
    for item in items {
        let Some(sub_q) = item.get("question").and_then(|v| v.as_str()) else { continue };
        let tool = match item.get("tool").and_then(|v| v.as_str()) {
            Some("graph") => "graph",
            _ => "vector",
        };
        routed.push((sub_q.to_string(), tool));
    }

    if routed.is_empty() {
        default
    } else {
        routed
    }
}

/// Synthesises sub-answers into one response (§4.6 step 7, *compact* mode:
/// a single LLM call over the concatenated context rather than one call
/// per sub-answer). `prompt_template` may be tenant-supplied and must
/// reference `{context_str}`/`{query_str}`; falls back to a built-in
/// template otherwise.
async fn synthesize(
    provider: &dyn LlmProvider,
    llm_config: &crate::config::LlmConfig,
    question: &str,
    sub_answers: &[String],
    prompt_template: Option<&str>,
) -> Result<String> {
    let context_str = sub_answers.join("\n\n---\n\n");

    if provider.model_name() == "disabled" {
        return Ok(context_str);
    }

    let template = prompt_template.unwrap_or(
        "Using only the context below, answer the question. Preserve verbatim quotes \
         from the context where relevant, cite source documents by title, and never \
         mention technical identifiers (IDs, internal field names).\n\n\
         Context:\n{context_str}\n\nQuestion: {query_str}",
    );

    let user_prompt = template
        .replace("{context_str}", &context_str)
        .replace("{query_str}", question);

    crate::llm::complete(
        provider,
        llm_config,
        "You are a precise assistant that answers only from the given context.",
        &user_prompt,
        false,
    )
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub is_time_filtered: bool,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub source_nodes: Vec<SourceNode>,
    pub metadata: QueryMetadata,
}

/// Answers a single question end to end (§4.6 contract:
/// `query(question, filters?) -> {answer, source_nodes, metadata}`).
pub async fn query(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn crate::embedding::EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    reranker: &dyn Reranker,
    tenant_id: &str,
    question: &str,
) -> Result<QueryResponse> {
    let now = Utc::now();

    let time_window = if has_time_keyword(question) {
        extract_time_window(llm_provider, &config.llm, question, now).await
    } else {
        None
    };

    let query_vector = if config.embedding.is_enabled() {
        crate::embedding::embed_texts_cached(pool, embedding_provider, &config.embedding, &[question.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let ctx = QueryContext {
        pool,
        config,
        reranker,
        tenant_id: tenant_id.to_string(),
        query_vector,
        time_window,
        now,
    };

    let vector_tool = VectorTool { ctx: &ctx };
    let graph_tool = GraphTool { ctx: &ctx };

    let sub_questions = decompose(llm_provider, &config.llm, question).await;

    let mut sub_answers = Vec::with_capacity(sub_questions.len());
    let mut source_nodes = Vec::new();

    for (sub_q, tool_name) in &sub_questions {
        let tool: &dyn Tool = if *tool_name == "graph" { &graph_tool } else { &vector_tool };
        match tool.retrieve(sub_q).await {
            Ok((answer, nodes)) => {
                sub_answers.push(answer);
                source_nodes.extend(nodes);
            }
            // Per-sub-question failures degrade the synthesised answer for
            // that sub-question, never the whole query (§4.6 propagation
            // policy).
            Err(e) => {
                tracing::warn!(tool = tool.name(), error = %e, "sub-question retrieval failed");
                sub_answers.push("the context does not address this".to_string());
            }
        }
    }

    let answer = synthesize(llm_provider, &config.llm, question, &sub_answers, None).await?;

    Ok(QueryResponse {
        answer,
        source_nodes,
        metadata: QueryMetadata {
            is_time_filtered: time_window.is_some(),
            start_timestamp: time_window.map(|w| w.start_timestamp),
            end_timestamp: time_window.map(|w| w.end_timestamp),
        },
    })
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Rough token estimate (~4 chars/token), matching the teacher's
/// budget-truncation style elsewhere in the pipeline (no tokenizer
/// dependency for a history-trimming heuristic).
fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Trims `history` to the newest turns that fit `token_budget`, newest
/// first (§4.6 `chat()`).
fn budget_history(history: &[ChatTurn], token_budget: usize) -> Vec<ChatTurn> {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for turn in history.iter().rev() {
        let cost = estimate_tokens(&turn.content);
        if used + cost > token_budget {
            break;
        }
        used += cost;
        kept.push(turn.clone());
    }
    kept.reverse();
    kept
}

/// `chat()` variant of [`query`]: prepends token-budgeted conversation
/// history to the question before decomposition/retrieval/synthesis.
#[allow(clippy::too_many_arguments)]
pub async fn chat(
    pool: &SqlitePool,
    config: &Config,
    embedding_provider: &dyn crate::embedding::EmbeddingProvider,
    llm_provider: &dyn LlmProvider,
    reranker: &dyn Reranker,
    tenant_id: &str,
    history: &[ChatTurn],
    message: &str,
) -> Result<QueryResponse> {
    let budgeted = budget_history(history, config.retrieval.chat_history_token_budget);

    let question = if budgeted.is_empty() {
        message.to_string()
    } else {
        let transcript: String = budgeted
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Conversation so far:\n{}\n\nCurrent message: {}", transcript, message)
    };

    query(pool, config, embedding_provider, llm_provider, reranker, tenant_id, &question).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_month_names() {
        assert!(has_time_keyword("show me emails from October 2024"));
        assert!(has_time_keyword("what happened in 2023?"));
    }

    #[test]
    fn no_time_keyword_for_untimed_question() {
        assert!(!has_time_keyword("what materials do we use?"));
    }

    #[test]
    fn recency_boost_decays_with_age() {
        let now = Utc::now();
        let fresh = recency_boosted_score(1.0, Some(now.timestamp()), 30.0, now);
        let old = recency_boosted_score(1.0, Some(now.timestamp() - 60 * 86_400), 30.0, now);
        assert!(fresh > old);
    }

    #[test]
    fn recency_boost_passes_through_without_timestamp() {
        let now = Utc::now();
        assert_eq!(recency_boosted_score(0.8, None, 30.0, now), 0.8_f32 as f64);
    }

    #[test]
    fn history_budget_keeps_newest_first() {
        let history = vec![
            ChatTurn { role: "user".to_string(), content: "a".repeat(4000) },
            ChatTurn { role: "assistant".to_string(), content: "b".repeat(100) },
        ];
        let kept = budget_history(&history, 50);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "b".repeat(100));
    }
}
