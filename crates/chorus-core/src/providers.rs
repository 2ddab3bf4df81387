//! LLM provider glue: OpenAI-compatible Chat Completions and embeddings
//! over reqwest. Implements the worker-side [`JobExecutor`] and the
//! orchestrator-side [`Embedder`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use crate::config::Config;
use crate::jobs::{Job, JobExecutor};
use crate::types::{GenerationPayload, MessageRole};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Turns text into a query vector for memory retrieval.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// One OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
}

impl OpenAiCompatible {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            // Local servers (Ollama and friends) accept any key.
            api_key: config.api_key.clone().unwrap_or_else(|| "ollama".to_string()),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .context("HTTP request failed")
    }

    /// Make a Chat Completions call and return the assistant text.
    pub async fn chat(&self, payload: &GenerationPayload) -> Result<String> {
        let url = self.url("chat/completions");
        let body = completions_body(payload, &self.model);

        info!(
            model = body["model"].as_str().unwrap_or_default(),
            msg_count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0),
            request_id = %payload.request_id,
            "chat_completions request"
        );

        let response = self.post(&url, &body).await?;
        let status = response.status();
        if status.is_success() {
            let data: serde_json::Value = response
                .json()
                .await
                .context("Failed to parse API response")?;
            return completion_text(&data);
        }

        let text = response.text().await.unwrap_or_default();
        error!("API HTTP {}: {} | url={}", status, truncate(&text, 500), url);

        // Retry once on 500 errors
        if status.as_u16() == 500 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let retry = self.post(&url, &body).await.context("Retry HTTP request failed")?;
            if !retry.status().is_success() {
                anyhow::bail!("API call failed after retry: HTTP {}", retry.status());
            }
            let data: serde_json::Value =
                retry.json().await.context("Failed to parse retry response")?;
            return completion_text(&data);
        }

        anyhow::bail!("API call failed: HTTP {}: {}", status, truncate(&text, 200));
    }
}

#[async_trait]
impl Embedder for OpenAiCompatible {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let response = self
            .post(&self.url("embeddings"), &body)
            .await
            .context("Embedding request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API HTTP {}: {}", status, truncate(&body_text, 200));
        }

        let data: serde_json::Value = response.json().await?;
        parse_embedding(&data)
    }
}

#[async_trait]
impl JobExecutor for OpenAiCompatible {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value> {
        let payload: GenerationPayload = serde_json::from_value(job.payload.clone())
            .context("Job payload is not a generation request")?;
        let content = self.chat(&payload).await?;
        Ok(json!({
            "content": content,
            "model": payload.model.as_deref().unwrap_or(&self.model),
        }))
    }
}

// ── Request building ──

fn system_prompt(payload: &GenerationPayload) -> String {
    let mut prompt = format!("You are {}.", payload.personality);
    if !payload.memories.is_empty() {
        prompt.push_str("\n\nThings you remember about this user:\n");
        for memory in &payload.memories {
            prompt.push_str("- ");
            prompt.push_str(memory);
            prompt.push('\n');
        }
    }
    if !payload.show_thinking {
        prompt.push_str("\nReply with your final answer only.");
    }
    prompt
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Chat Completions request body. Unset sampling overrides are left out so
/// the provider's own defaults apply.
fn completions_body(payload: &GenerationPayload, default_model: &str) -> serde_json::Value {
    let mut messages = vec![json!({"role": "system", "content": system_prompt(payload)})];
    messages.extend(
        payload
            .history
            .iter()
            .map(|m| json!({"role": role_name(m.role), "content": m.content})),
    );
    messages.push(json!({"role": "user", "content": payload.content}));

    let mut body = json!({
        "model": payload.model.as_deref().unwrap_or(default_model),
        "messages": messages,
    });
    if let Some(t) = payload.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = payload.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(n) = payload.max_tokens {
        body["max_tokens"] = json!(n);
    }
    body
}

// ── Response parsing ──

fn completion_text(response: &serde_json::Value) -> Result<String> {
    response["choices"][0]["message"]
        .get("content")
        .and_then(|v| v.as_str())
        .map(String::from)
        .context("Completion response has no message content")
}

fn parse_embedding(data: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(data["data"][0]["embedding"]
        .as_array()
        .context("Invalid embedding response")?
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
