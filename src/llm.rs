use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One chat-completion call: a system message, a user message and the
/// sampling settings.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: 0.1,
            max_tokens: 1500,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn user_prompt(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Text-completion provider. Implementations must be safe to share across
/// request tasks.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client (OpenAI, DeepSeek, ...).
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssistantError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        debug!("Calling {} with model {}", self.base_url, self.model);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistantError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistantError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let message = response_json["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(AssistantError::Llm(format!(
                "LLM API returned {}: {}",
                status, message
            )));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AssistantError::Llm("No content in LLM response".to_string()))?;

        Ok(content.trim().to_string())
    }
}

/// Remove a markdown code fence wrapping the whole response, with or
/// without a language tag.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop a language tag such as `json`, `sql` or `javascript`.
    let inner = match inner.find('\n') {
        Some(newline)
            if inner[..newline]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            &inner[newline + 1..]
        }
        _ => inner,
    };
    inner.trim()
}
