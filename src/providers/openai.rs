// OpenAI-compatible provider
//
// Works against OpenAI itself and against local servers that speak the same
// chat-completions format (llama.cpp, vLLM, Ollama's /v1 endpoint).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatRequest, ChatResponse, LlmProvider};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// OpenAI chat-completions client
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    provider_name: String,
}

impl OpenAIProvider {
    /// Hosted OpenAI API
    pub fn new_openai(api_key: String) -> Result<Self> {
        Self::new(
            "openai",
            "https://api.openai.com",
            "gpt-4o-mini",
            Some(api_key),
        )
    }

    /// Any OpenAI-compatible endpoint. `base_url` may or may not end in `/v1`.
    pub fn new(
        provider_name: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            provider_name: provider_name.into(),
        })
    }

    /// Set custom model for this provider
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn completions_url(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }

    fn to_openai_request(&self, request: &ChatRequest) -> OpenAIRequest {
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let mut messages = Vec::with_capacity(2);
        // System prompt goes first as a {"role":"system"} message
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        OpenAIRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.to_openai_request(request);
        let url = self.completions_url();

        tracing::debug!(provider = %self.provider_name, model = %body.model, "sending chat completion");

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", self.provider_name))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "{} request failed\n\nStatus: {}\nBody: {}",
                self.provider_name,
                status,
                error_body
            );
        }

        let parsed: OpenAIResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.provider_name))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .with_context(|| format!("{} returned no choices", self.provider_name))?;

        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            model: parsed.model.unwrap_or(body.model),
            provider: self.provider_name.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.provider_name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
