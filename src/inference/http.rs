// HTTP inference fallback, used when the native worker is disabled

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Generate, GenerationParams};
use crate::config::InferenceConfig;
use crate::errors::InferenceError;
use crate::providers::{ChatRequest, LlmProvider, OpenAIProvider};

/// Generation through an OpenAI-compatible chat endpoint
pub struct HttpExecutor {
    provider: OpenAIProvider,
}

impl HttpExecutor {
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let endpoint = config
            .http_endpoint
            .clone()
            .context("inference.http_endpoint is required when native_enabled = false")?;
        let model = config
            .http_model
            .clone()
            .unwrap_or_else(|| "gemma".to_string());
        let provider = OpenAIProvider::new("local-http", endpoint, model, None)?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl Generate for HttpExecutor {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        let request = ChatRequest::new(prompt)
            .with_model(params.model.clone())
            .with_limits(params.max_tokens, params.temperature);

        self.provider
            .complete(&request)
            .await
            .map(|resp| resp.text)
            .map_err(|e| InferenceError::ProcessFailure(format!("{:#}", e)))
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}
