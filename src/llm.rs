//! Text-completion provider trait and concrete implementations.
//!
//! Mirrors the teacher's `EmbeddingProvider` abstraction in
//! `embedding.rs`: library code only depends on the [`LlmProvider`]
//! trait, concrete HTTP clients live here, and retry/backoff follows
//! the same exponential-backoff shape as the teacher's OpenAI client.
//! Only the request/response contract is consumed — prompt design and
//! model choice are the caller's concern.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::RecallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
}

/// A pluggable text-completion backend.
///
/// Implementations raise [`RecallError::ExtractionRateLimited`] rather
/// than a generic transport error when the provider signals 429, so
/// callers (the extraction pipeline) can back off instead of failing
/// the whole batch.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<GenerateResponse, RecallError>;

    /// Cheap connectivity/credential check, used by `recall doctor`.
    async fn validate(&self) -> (bool, String);

    fn model_name(&self) -> &str;
}

/// Construct the provider named by `config.provider`.
pub fn create_provider(config: &LlmConfig) -> anyhow::Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::new(config)?)),
        "openai" => Ok(Box::new(OpenAiCompatibleProvider::new(
            config,
            config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        )?)),
        "ollama" => Ok(Box::new(OpenAiCompatibleProvider::new_unauthenticated(
            config,
            config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
        ))),
        "stub" | "disabled" => Ok(Box::new(StubProvider::new(config.model.clone()))),
        other => anyhow::bail!("unknown llm provider: {}", other),
    }
}

fn api_key_from_env(config: &LlmConfig, default_var: &str) -> anyhow::Result<String> {
    let var = config.api_key_env.as_deref().unwrap_or(default_var);
    std::env::var(var).map_err(|_| anyhow!("environment variable {} not set", var))
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(200 * 2u64.pow(attempt.min(5)))
}

// --- Anthropic ---------------------------------------------------------

/// Calls the Anthropic Messages API (`POST /v1/messages`).
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = api_key_from_env(config, "ANTHROPIC_API_KEY")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            api_key,
            model: config.model.clone(),
            max_retries: 3,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(
        &self,
        messages: &[Message],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<GenerateResponse, RecallError> {
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "system": system,
            "messages": turns,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let resp = self
                .client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| RecallError::ExtractionFailed(e.to_string()))?;
                        return parse_anthropic_response(&json, &self.model);
                    }
                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        return Err(RecallError::ExtractionRateLimited(retry_after));
                    }
                    if status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(RecallError::ExtractionFailed(format!(
                            "anthropic api error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(RecallError::ExtractionFailed(format!(
                        "anthropic api error {}: {}",
                        status, text
                    )));
                }
                Err(e) if e.is_timeout() => {
                    return Err(RecallError::ExtractionTimeout(Duration::ZERO));
                }
                Err(e) => {
                    last_err = Some(RecallError::ExtractionFailed(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RecallError::ExtractionFailed("retries exhausted".into())))
    }

    async fn validate(&self) -> (bool, String) {
        let probe = [Message::user("ping")];
        match self.generate(&probe, 0.0, 8).await {
            Ok(_) => (true, "anthropic provider reachable".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_anthropic_response(
    json: &serde_json::Value,
    model: &str,
) -> Result<GenerateResponse, RecallError> {
    let content = json
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.first())
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| {
            RecallError::ExtractionFailed("anthropic response missing content[0].text".into())
        })?
        .to_string();

    let usage = json.get("usage").map(|u| Usage {
        prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).map(|v| v as u32),
        completion_tokens: u
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
    });

    Ok(GenerateResponse {
        content,
        model: model.to_string(),
        usage,
    })
}

// --- OpenAI-compatible (OpenAI, Ollama) ---------------------------------

/// Calls a `POST /chat/completions` endpoint on the OpenAI wire format,
/// shared by OpenAI itself and Ollama's OpenAI-compatible surface.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig, base_url: String) -> anyhow::Result<Self> {
        let api_key = api_key_from_env(config, "OPENAI_API_KEY")?;
        Ok(Self::build(config, base_url, Some(api_key)))
    }

    pub fn new_unauthenticated(config: &LlmConfig, base_url: String) -> Self {
        Self::build(config, base_url, None)
    }

    fn build(config: &LlmConfig, base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .expect("reqwest client builder");
        Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            max_retries: 3,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate(
        &self,
        messages: &[Message],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<GenerateResponse, RecallError> {
        let turns: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "messages": turns,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let mut req = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("content-type", "application/json");
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| RecallError::ExtractionFailed(e.to_string()))?;
                        return parse_openai_chat_response(&json, &self.model);
                    }
                    if status.as_u16() == 429 {
                        return Err(RecallError::ExtractionRateLimited(None));
                    }
                    if status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(RecallError::ExtractionFailed(format!(
                            "chat completion error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(RecallError::ExtractionFailed(format!(
                        "chat completion error {}: {}",
                        status, text
                    )));
                }
                Err(e) if e.is_timeout() => {
                    return Err(RecallError::ExtractionTimeout(Duration::ZERO));
                }
                Err(e) => {
                    last_err = Some(RecallError::ExtractionFailed(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RecallError::ExtractionFailed("retries exhausted".into())))
    }

    async fn validate(&self) -> (bool, String) {
        let probe = [Message::user("ping")];
        match self.generate(&probe, 0.0, 8).await {
            Ok(_) => (true, format!("{} provider reachable", self.base_url)),
            Err(e) => (false, e.to_string()),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_openai_chat_response(
    json: &serde_json::Value,
    model: &str,
) -> Result<GenerateResponse, RecallError> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            RecallError::ExtractionFailed("response missing choices[0].message.content".into())
        })?
        .to_string();

    let usage = json.get("usage").map(|u| Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).map(|v| v as u32),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
    });

    Ok(GenerateResponse {
        content,
        model: model.to_string(),
        usage,
    })
}

// --- Stub ----------------------------------------------------------------

/// Deterministic no-network provider for tests and `provider = "disabled"`.
/// Always returns an empty learnings array so the extraction pipeline has
/// a well-defined, side-effect-free path through `cargo test`.
pub struct StubProvider {
    model: String,
}

impl StubProvider {
    pub fn new(model: String) -> Self {
        Self { model }
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn generate(
        &self,
        _messages: &[Message],
        _temperature: f64,
        _max_tokens: u32,
    ) -> Result<GenerateResponse, RecallError> {
        Ok(GenerateResponse {
            content: "[]".to_string(),
            model: self.model.clone(),
            usage: None,
        })
    }

    async fn validate(&self) -> (bool, String) {
        (true, "stub provider always reachable".to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_returns_empty_array() {
        let provider = StubProvider::new("stub-model".to_string());
        let resp = provider
            .generate(&[Message::user("hello")], 0.1, 100)
            .await
            .unwrap();
        assert_eq!(resp.content, "[]");
        assert_eq!(resp.model, "stub-model");
    }

    #[test]
    fn parse_anthropic_response_extracts_text_and_usage() {
        let json = serde_json::json!({
            "content": [{"type": "text", "text": "hello world"}],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let resp = parse_anthropic_response(&json, "claude-sonnet-4-20250514").unwrap();
        assert_eq!(resp.content, "hello world");
        assert_eq!(resp.usage.unwrap().prompt_tokens, Some(10));
    }

    #[test]
    fn parse_openai_chat_response_extracts_message_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2},
        });
        let resp = parse_openai_chat_response(&json, "gpt-4o-mini").unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.usage.unwrap().completion_tokens, Some(2));
    }
}
