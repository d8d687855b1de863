// N2: local model with memory context

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::confidence::Confidence;
use super::prompt;
use super::tier::{judge, EscalationTier, TierContext, TierHandler, TierOutcome};
use crate::errors::{DaemonError, InferenceError};
use crate::inference::{self, GenerationParams, Generate};
use crate::memory::{KnowledgeStore, MemoryHit, MemoryKind};
use crate::protocol::Action;

/// Share of the attempt deadline the memory lookup may use
const MEMORY_SHARE: u32 = 4;

pub struct LocalMemoryTier {
    executor: Arc<dyn Generate>,
    memory: Arc<dyn KnowledgeStore>,
    params: GenerationParams,
    confidence: Arc<Confidence>,
    timeout: Duration,
    context_limit: usize,
}

impl LocalMemoryTier {
    pub fn new(
        executor: Arc<dyn Generate>,
        memory: Arc<dyn KnowledgeStore>,
        params: GenerationParams,
        confidence: Arc<Confidence>,
        timeout: Duration,
        context_limit: usize,
    ) -> Self {
        Self {
            executor,
            memory,
            params,
            confidence,
            timeout,
            context_limit,
        }
    }

    /// Memories for the prompt. Lookup failures only cost context.
    async fn context(&self, ctx: &TierContext<'_>) -> Vec<MemoryHit> {
        if !ctx.research.is_empty() {
            return ctx.research.to_vec();
        }
        if self.context_limit == 0 {
            return Vec::new();
        }

        let budget = ctx.deadline / MEMORY_SHARE;
        let search = self.memory.search(ctx.prompt, self.context_limit * 2);
        let hits = match tokio::time::timeout(budget, search).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                debug!(error = %e, "memory context unavailable");
                return Vec::new();
            }
            Err(_) => {
                debug!(budget = ?budget, "memory context lookup timed out");
                return Vec::new();
            }
        };

        // Plans only take persona memories; stored facts go to ask/research
        hits.into_iter()
            .filter(|h| ctx.action != Action::Plan || h.kind == MemoryKind::Personality)
            .take(self.context_limit * 2)
            .collect()
    }
}

#[async_trait]
impl TierHandler for LocalMemoryTier {
    fn tier(&self) -> EscalationTier {
        EscalationTier::LocalMemory
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &TierContext<'_>) -> TierOutcome {
        let started = Instant::now();
        let hits = self.context(ctx).await;

        let system = prompt::system_prompt(ctx, &hits);
        let user = prompt::user_prompt(ctx, &hits);
        let text = prompt::flatten(&system, &user);

        let params = self.params.clone().with_model_hint(ctx.model_hint);
        let remaining = ctx.deadline.saturating_sub(started.elapsed());

        match inference::invoke(self.executor.as_ref(), &text, &params, remaining).await {
            Ok((answer, elapsed)) => judge(ctx, &self.confidence, answer, elapsed, self.executor.name()),
            Err(InferenceError::EmptyOutput) => {
                TierOutcome::LowConfidence(format!("{}: empty output", self.executor.name()))
            }
            Err(e) => {
                warn!(executor = self.executor.name(), error = %e, "local inference failed");
                TierOutcome::HardFailure(DaemonError::Inference(e))
            }
        }
    }
}
