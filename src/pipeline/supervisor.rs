// N4: online supervisor
//
// Only available when an API key is configured. This is the only tier that
// sends request content off the host.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::confidence::Confidence;
use super::prompt;
use super::tier::{judge, EscalationTier, TierContext, TierHandler, TierOutcome};
use crate::config::{SupervisorEntry, SupervisorProvider};
use crate::errors::{DaemonError, InferenceError};
use crate::providers::{ChatRequest, GeminiProvider, LlmProvider, OpenAIProvider};

const SUPERVISOR_INSTRUCTIONS: &str = "The local models could not answer this request with \
confidence. Give a definitive, complete answer.";

pub struct SupervisorTier {
    provider: Option<Arc<dyn LlmProvider>>,
    confidence: Arc<Confidence>,
    timeout: Duration,
}

impl SupervisorTier {
    pub fn new(
        provider: Option<Arc<dyn LlmProvider>>,
        confidence: Arc<Confidence>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            confidence,
            timeout,
        }
    }

    pub fn from_config(
        entry: Option<&SupervisorEntry>,
        confidence: Arc<Confidence>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let provider = match entry.filter(|e| !e.api_key.trim().is_empty()) {
            Some(entry) => Some(build_provider(entry)?),
            None => None,
        };
        if let Some(p) = &provider {
            info!(provider = p.name(), model = p.default_model(), "online supervisor configured");
        }
        Ok(Self::new(provider, confidence, timeout))
    }
}

fn build_provider(entry: &SupervisorEntry) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let key = entry.api_key.trim().to_string();
    Ok(match entry.provider {
        SupervisorProvider::Gemini => {
            let mut provider = GeminiProvider::new(key)?;
            if let Some(model) = &entry.model {
                provider = provider.with_model(model.clone());
            }
            if let Some(url) = &entry.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Arc::new(provider)
        }
        SupervisorProvider::Openai => {
            let mut provider = match &entry.base_url {
                Some(url) => OpenAIProvider::new("openai", url.clone(), "gpt-4o-mini", Some(key))?,
                None => OpenAIProvider::new_openai(key)?,
            };
            if let Some(model) = &entry.model {
                provider = provider.with_model(model.clone());
            }
            Arc::new(provider)
        }
    })
}

#[async_trait]
impl TierHandler for SupervisorTier {
    fn tier(&self) -> EscalationTier {
        EscalationTier::OnlineSupervisor
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    async fn attempt(&self, ctx: &TierContext<'_>) -> TierOutcome {
        let Some(provider) = &self.provider else {
            return TierOutcome::LowConfidence("no supervisor configured".to_string());
        };

        let system = format!(
            "{}\n\n{}",
            prompt::system_prompt(ctx, ctx.research),
            SUPERVISOR_INSTRUCTIONS
        );
        let request = ChatRequest::new(prompt::user_prompt(ctx, ctx.research)).with_system(system);

        let started = Instant::now();
        match tokio::time::timeout(ctx.deadline, provider.complete(&request)).await {
            Ok(Ok(response)) => judge(
                ctx,
                &self.confidence,
                response.text.trim().to_string(),
                started.elapsed(),
                provider.name(),
            ),
            Ok(Err(e)) => {
                warn!(provider = provider.name(), error = %e, "supervisor request failed");
                TierOutcome::HardFailure(DaemonError::Inference(InferenceError::ProcessFailure(
                    format!("{}: {:#}", provider.name(), e),
                )))
            }
            Err(_) => TierOutcome::HardFailure(DaemonError::Inference(InferenceError::Timeout(
                ctx.deadline,
            ))),
        }
    }
}
