//! OpenAI-compatible chat completions client.
//! Groq and Gemini both expose `{base}/chat/completions` with bearer auth,
//! so one implementation covers every configured preset.

use crate::config::{ModelPricing, ProviderConfig};
use crate::providers::traits::{LlmClient, LlmResponse};
use crate::session::{Message, Role};
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const GROQ_DEFAULT_MODEL: &str = "llama-3.1-8b-instant";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Longest slice of an error body carried into an error message.
const ERROR_BODY_CHARS: usize = 200;

pub struct OpenAiCompatibleClient {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) model: String,
    pub(crate) api_key: Option<String>,
    temperature: f64,
    pricing: ModelPricing,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(name: &str, base_url: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(ToString::to_string),
            temperature: 0.4,
            pricing: ModelPricing::default(),
            client: build_client(Duration::from_secs(60)),
        }
    }

    /// Resolve a preset (`groq`, `gemini`, `custom`) plus overrides.
    pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Self> {
        let (preset_url, preset_model) = match config.kind.as_str() {
            "groq" => (Some(GROQ_BASE_URL), Some(GROQ_DEFAULT_MODEL)),
            "gemini" => (Some(GEMINI_BASE_URL), Some(GEMINI_DEFAULT_MODEL)),
            "custom" => (None, None),
            other => {
                anyhow::bail!("Unknown provider kind '{other}' (expected groq, gemini or custom)")
            }
        };

        let base_url = config
            .base_url
            .as_deref()
            .or(preset_url)
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' requires base_url", config.kind))?;
        let model = config
            .model
            .as_deref()
            .or(preset_model)
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' requires model", config.kind))?;

        Ok(Self {
            name: config.kind.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            temperature: config.temperature,
            pricing: config.pricing.clone(),
            client: build_client(Duration::from_secs(config.request_timeout_secs.max(1))),
        })
    }

    #[must_use]
    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_messages(system_prompt: &str, history: &[Message], text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        messages.extend(history.iter().map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));
        messages.push(ChatMessage {
            role: Role::User.as_str().to_string(),
            content: text.to_string(),
        });
        messages
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        text: &str,
        system_prompt: &str,
        history: &[Message],
    ) -> anyhow::Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: Self::build_messages(system_prompt, history, text),
            temperature: self.temperature,
        };

        let started = Instant::now();
        let mut req = self.client.post(self.chat_url()).json(&request);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "{} API error ({}): {}",
                self.name,
                status,
                truncate_with_ellipsis(body.trim(), ERROR_BODY_CHARS)
            );
        }

        let chat_response: ChatResponse = response.json().await?;
        let latency = started.elapsed();

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No response from {}", self.name))?;

        let usage = chat_response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd: self
                .pricing
                .cost_usd(usage.prompt_tokens, usage.completion_tokens),
            latency,
        })
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        // Any response (even 401/404) means the TLS connection is pooled.
        self.client.get(&self.base_url).send().await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
