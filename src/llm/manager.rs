//! Thin client for an OpenAI-compatible chat completions endpoint.

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::Result;
use anyhow::Context;
use serde_json::json;
use std::time::Duration;

/// Completion output with usage accounting.
#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub content: String,
    pub tokens_used: u64,
}

pub struct LlmManager {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Strip an optional `provider/` prefix from a model spec.
    ///
    /// `openai/gpt-4o-mini` and `gpt-4o-mini` both resolve to `gpt-4o-mini`;
    /// the provider half is routing metadata for gateways that want it in the
    /// URL rather than the body.
    pub fn resolve_model(spec: &str) -> &str {
        match spec.split_once('/') {
            Some((_provider, model)) if !model.is_empty() => model,
            _ => spec,
        }
    }

    /// Run one system + user exchange and return the assistant's reply.
    pub async fn chat(&self, model: &str, system: &str, user: &str) -> Result<ChatOutput> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        let body = json!({
            "model": Self::resolve_model(model),
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.7,
        });

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderRequest(format!("{status}: {text}")).into());
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::CompletionFailed("completion had no message content".to_string())
            })?;

        let tokens_used = payload["usage"]["total_tokens"].as_u64().unwrap_or(0);

        Ok(ChatOutput {
            content,
            tokens_used,
        })
    }
}

impl std::fmt::Debug for LlmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmManager")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
