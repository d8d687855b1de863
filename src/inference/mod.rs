// Inference executor
//
// `generate(prompt, params) -> text` behind a trait. The native path runs the
// model inside a supervised worker process; the fallback posts to an
// OpenAI-compatible HTTP endpoint. Deadlines are always enforced here, on the
// caller side, never trusted to the worker.

mod http;
mod worker;

pub use http::HttpExecutor;
pub use worker::WorkerExecutor;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::InferenceConfig;
use crate::errors::InferenceError;

/// Generation parameters forwarded verbatim to the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deterministic: bool,
    pub multiturn: bool,
    pub prefill_tbatch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationParams {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            tokenizer: config.tokenizer.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            deterministic: config.deterministic,
            multiturn: config.multiturn,
            prefill_tbatch: config.prefill_tbatch,
            model: config.http_model.clone(),
        }
    }

    /// Apply a client's model hint
    pub fn with_model_hint(mut self, hint: Option<&str>) -> Self {
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            self.model = Some(hint.to_string());
        }
        self
    }
}

/// One generation call. Implementations must be cancel-safe: dropping the
/// returned future releases whatever the call was holding.
#[async_trait]
pub trait Generate: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, InferenceError>;

    fn name(&self) -> &str;
}

/// Run one generation under a hard deadline.
///
/// Returns the trimmed text and the elapsed time. Whitespace-only output is
/// `EmptyOutput`; a missed deadline is `Timeout` and the call is dropped.
pub async fn invoke(
    executor: &dyn Generate,
    prompt: &str,
    params: &GenerationParams,
    deadline: Duration,
) -> Result<(String, Duration), InferenceError> {
    let started = Instant::now();
    let text = tokio::time::timeout(deadline, executor.generate(prompt, params))
        .await
        .map_err(|_| InferenceError::Timeout(deadline))??;

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(InferenceError::EmptyOutput);
    }
    Ok((trimmed.to_string(), started.elapsed()))
}

/// Build the executor the config asks for.
pub fn build_executor(config: &InferenceConfig) -> anyhow::Result<Arc<dyn Generate>> {
    if config.native_enabled {
        Ok(Arc::new(WorkerExecutor::spawn(config)?))
    } else {
        Ok(Arc::new(HttpExecutor::from_config(config)?))
    }
}
