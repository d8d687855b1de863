// Remote LLM providers
//
// Thin non-streaming clients used by the team tier (local OpenAI-compatible
// servers such as llama.cpp), the online supervisor, and the HTTP inference
// fallback. Each call is a single attempt: retrying is the pipeline's job,
// and it retries by escalating, not by calling the same tier again.

use anyhow::Result;
use async_trait::async_trait;

pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;

/// A single-turn completion request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Empty means the provider's default model
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = Some(max_tokens);
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    pub provider: String,
}

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one request and wait for the complete answer
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Provider name (e.g. "openai", "gemini", or a team role)
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider with a canned reply after an optional delay
    pub struct ScriptedProvider {
        name: String,
        reply: Result<String, String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn reply(name: &str, text: &str) -> Self {
            Self {
                name: name.to_string(),
                reply: Ok(text.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn fail(name: &str, message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                ..Self::reply(name, "")
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.reply {
                Ok(text) => Ok(ChatResponse {
                    text: text.clone(),
                    model: "scripted".to_string(),
                    provider: self.name.clone(),
                }),
                Err(message) => Err(anyhow::anyhow!("{}", message)),
            }
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn default_model(&self) -> &str {
            "scripted"
        }
    }
}
