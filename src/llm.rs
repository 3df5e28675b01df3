//! # LLM: Text-Completion Collaborator
//!
//! A narrow request/response contract used by the risk agent and the LLM
//! planner. Responses are untrusted text; callers pull a JSON object out with
//! [`extract_json`] and validate it against their own schema.
//!
//! [`HttpLlmClient`] speaks the widely supported chat-completions shape:
//!
//! ```text
//! POST {endpoint}
//! { "model": ..., "messages": [{"role":"system",...},{"role":"user",...}],
//!   "temperature": ..., "max_tokens": ... }
//! → { "choices": [ { "message": { "content": "..." } } ] }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{ProviderError, RetryPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &LlmPrompt) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 2_000,
            timeout_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> anyhow::Result<Self> {
        let endpoint = url::Url::parse(&config.endpoint)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &LlmPrompt) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        let mut req = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after_ms = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &text, retry_after_ms));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// `Retry-After` in seconds, converted to milliseconds.
pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1_000)
}

/// Pull the first JSON object out of free-form model output.
///
/// Accepts bare JSON, fenced ```json blocks, and JSON surrounded by prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let unfenced = trimmed
        .split("```")
        .map(|block| block.trim_start_matches("json").trim())
        .find(|block| block.starts_with('{'));
    if let Some(block) = unfenced {
        if let Ok(v @ serde_json::Value::Object(_)) = serde_json::from_str(block) {
            return Some(v);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(v @ serde_json::Value::Object(_)) => Some(v),
        _ => None,
    }
}
