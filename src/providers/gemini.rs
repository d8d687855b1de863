// Google Gemini API provider
//
// Gemini uses `contents`/`parts` instead of chat messages and takes the
// system prompt as `systemInstruction`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatRequest, ChatResponse, LlmProvider};

const REQUEST_TIMEOUT_SECS: u64 = 120;
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini API provider
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            default_model: "gemini-1.5-pro-latest".to_string(),
        })
    }

    /// Create with custom default model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Point at a different API root (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn to_gemini_request(&self, request: &ChatRequest) -> GeminiRequest {
        GeminiRequest {
            system_instruction: request.system.as_ref().map(|s| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: s.clone() }],
            }),
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        tracing::debug!(model = %model, "sending request to Gemini API");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&self.to_gemini_request(request))
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Gemini API request failed\n\nStatus: {}\nBody: {}",
                status,
                error_body
            );
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .context("Failed to parse Gemini API response")?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .context("Gemini returned no candidates in response")?;

        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            text,
            model,
            provider: "gemini".to_string(),
        })
    }

    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}
