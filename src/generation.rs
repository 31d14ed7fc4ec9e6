//! Answer generation through an external chat-completion service.
//!
//! The only network backend speaks the OpenAI `chat/completions` protocol,
//! which Groq (the default), OpenAI and most hosted gateways accept. The API
//! key is read from the environment variable named by
//! `[generation].api_key_env`; a missing key does not prevent startup, it
//! only makes each generation call fail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{CopilotError, Result};

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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A text generator. Implementations return [`CopilotError::Generation`]
/// for every failure so callers can still surface retrieved sources.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _model: &str, _messages: &[ChatMessage]) -> Result<String> {
        Err(CopilotError::Generation(
            "generation provider is disabled".to_string(),
        ))
    }
}

pub struct OpenAiCompatGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    max_retries: u32,
    temperature: f32,
}

impl OpenAiCompatGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!(var = %config.api_key_env, "generation API key not set; /ask will return generation_failed");
        }
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            api_key,
            max_retries: config.max_retries,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            CopilotError::Generation(format!("{} environment variable not set", self.api_key_env))
        })?;

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            CopilotError::Generation(format!("unreadable completion response: {}", e))
                        })?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = CopilotError::Generation(format!("LLM API error {}: {}", status, body_text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(CopilotError::Generation(if e.is_timeout() {
                        "LLM request timed out".to_string()
                    } else {
                        format!("LLM request failed: {}", e)
                    }));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CopilotError::Generation("generation failed after retries".to_string())))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CopilotError::Generation("no content in completion response".to_string()))
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiCompatGenerator::new(config)?)),
        other => Err(CopilotError::Config(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}
