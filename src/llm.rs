//! Chat-completion provider abstraction.
//!
//! Mirrors [`crate::embedding`]'s provider shape for the other external
//! model surface the pipeline needs: entity/relation extraction (§4.2),
//! relationship validation (§4.3), query-time extraction (§4.5), and
//! synthesis (§4.6). Like the embedding provider, dispatch is config-based
//! and the `"disabled"` provider always errors.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::LlmConfig;

/// Trait for chat-completion providers. The model identifier is used for
/// logging and for picking the extraction vs. query model at call sites.
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;
}

pub struct DisabledLlmProvider;

impl LlmProvider for DisabledLlmProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
}

pub struct OpenAiLlmProvider {
    model: String,
}

impl OpenAiLlmProvider {
    pub fn new(model: String) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self { model })
    }
}

impl LlmProvider for OpenAiLlmProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Creates a provider for the extraction model (entity/relation extraction
/// and validation both use this model per §4.2/§4.3).
pub fn create_extraction_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlmProvider)),
        "openai" => {
            let model = config
                .extraction_model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("llm.extraction_model required for OpenAI provider"))?;
            Ok(Box::new(OpenAiLlmProvider::new(model)?))
        }
        other => bail!("Unknown LLM provider: {}", other),
    }
}

/// Creates a provider for the query-time model (time extraction, routing,
/// synthesis per §4.5/§4.6).
pub fn create_query_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlmProvider)),
        "openai" => {
            let model = config
                .query_model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("llm.query_model required for OpenAI provider"))?;
            Ok(Box::new(OpenAiLlmProvider::new(model)?))
        }
        other => bail!("Unknown LLM provider: {}", other),
    }
}

/// Calls the OpenAI chat completions endpoint with a system/user prompt
/// pair. `json_mode` requests `response_format: json_object`, used by the
/// time extractor (§4.5) and the extractor (§4.2). Retries transient
/// failures (429, 5xx, network) with the same 1s/2s/4s backoff as the
/// embedding provider.
pub async fn complete(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    system_prompt: &str,
    user_prompt: &str,
    json_mode: bool,
) -> Result<String> {
    if provider.model_name() == "disabled" {
        bail!("LLM provider is disabled");
    }

    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut body = serde_json::json!({
        "model": provider.model_name(),
        "temperature": 0,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ],
    });
    if json_mode {
        body["response_format"] = serde_json::json!({"type": "json_object"});
    }

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_chat_response(&json);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("OpenAI chat API error {}: {}", status, text));
                    continue;
                }
                let text = response.text().await.unwrap_or_default();
                bail!("OpenAI chat API error {}: {}", status, text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed after retries")))
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat completion response: missing content"))
}
