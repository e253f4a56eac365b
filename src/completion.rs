//! Text-completion provider abstraction.
//!
//! The synthesizer treats the language model as an opaque chat-completion
//! service: messages in, text out. Two HTTP implementations are provided:
//! - **[`OpenAIChatProvider`]**: `POST {url}/chat/completions`
//! - **[`OllamaChatProvider`]**: `POST {url}/api/chat` (non-streaming)
//!
//! Output is never trusted; see [`crate::validate`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::CompletionConfig;
use crate::http::{build_client, JsonEndpoint};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An injected text-completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Return the assistant reply to `messages`.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ============ OpenAI ============

pub struct OpenAIChatProvider {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatProvider {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("completion.api_key required for OpenAI provider"))?;

        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        let endpoint = JsonEndpoint {
            client: &self.client,
            url: format!("{}/chat/completions", self.url.trim_end_matches('/')),
            bearer: Some(&self.api_key),
            service: "OpenAI chat",
            max_retries: self.max_retries,
        };
        let json = endpoint.post(&body).await?;
        parse_openai_chat(&json)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Ollama ============

pub struct OllamaChatProvider {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChatProvider {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let endpoint = JsonEndpoint {
            client: &self.client,
            url: format!("{}/api/chat", self.url.trim_end_matches('/')),
            bearer: None,
            service: "Ollama chat",
            max_retries: self.max_retries,
        };
        let json = endpoint.post(&body).await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))
    }
}

/// Create the [`CompletionProvider`] named by `config.provider`.
pub fn create_provider(config: &CompletionConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChatProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChatProvider::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}
