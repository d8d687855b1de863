// Escalation tiers and the uniform handler interface

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use super::confidence::Confidence;
use super::plan::parse_steps;
use crate::errors::DaemonError;
use crate::memory::MemoryHit;
use crate::protocol::Action;
use crate::session::SessionSnapshot;

/// Ordered escalation levels. A request only ever moves up this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscalationTier {
    Cache,
    LocalMemory,
    LocalTeam,
    OnlineSupervisor,
    GiveUp,
}

impl EscalationTier {
    /// Wire code reported in `tier_used`
    pub fn code(&self) -> &'static str {
        match self {
            EscalationTier::Cache => "N1",
            EscalationTier::LocalMemory => "N2",
            EscalationTier::LocalTeam => "N3",
            EscalationTier::OnlineSupervisor => "N4",
            EscalationTier::GiveUp => "N5",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EscalationTier::Cache => "cache",
            EscalationTier::LocalMemory => "local_memory",
            EscalationTier::LocalTeam => "local_team",
            EscalationTier::OnlineSupervisor => "online_supervisor",
            EscalationTier::GiveUp => "give_up",
        }
    }
}

impl fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Everything a tier handler may look at for one attempt
#[derive(Debug, Clone)]
pub struct TierContext<'a> {
    pub action: Action,
    pub prompt: &'a str,
    pub session: Option<&'a SessionSnapshot>,
    /// Snippets retrieved before escalation (research)
    pub research: &'a [MemoryHit],
    /// System observation to interpret (observe routed as ask)
    pub observation: Option<&'a str>,
    pub model_hint: Option<&'a str>,
    /// Include the session transcript in prompts
    pub multiturn: bool,
    /// Time this attempt may take: min(tier timeout, remaining request budget)
    pub deadline: Duration,
}

impl TierContext<'_> {
    /// Answers for this context may be served from and written to the cache
    pub fn cacheable(&self) -> bool {
        self.action.is_cacheable() && self.observation.is_none()
    }
}

/// A usable answer produced by a tier
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    /// Parsed steps (plan only)
    pub steps: Option<Vec<String>>,
    pub score: f32,
    pub inference_time: Duration,
    /// Which backend produced it (executor, specialist role, provider)
    pub backend: String,
}

/// Result of one tier attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Usable(Answer),
    /// No answer or not good enough; escalate
    LowConfidence(String),
    /// Backend failed; escalate and record
    HardFailure(DaemonError),
}

#[async_trait]
pub trait TierHandler: Send + Sync {
    fn tier(&self) -> EscalationTier;

    /// Configured per-attempt timeout
    fn timeout(&self) -> Duration;

    /// Unconfigured tiers are skipped without counting as an escalation
    fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, ctx: &TierContext<'_>) -> TierOutcome;
}

/// Apply the confidence predicate (and the step structure for plans) to raw
/// backend text.
pub fn judge(
    ctx: &TierContext<'_>,
    confidence: &Confidence,
    text: String,
    inference_time: Duration,
    backend: &str,
) -> TierOutcome {
    let score = match confidence.assess(&text) {
        Ok(score) => score,
        Err(reason) => return TierOutcome::LowConfidence(format!("{}: {}", backend, reason)),
    };

    let steps = if ctx.action == Action::Plan {
        match parse_steps(&text) {
            Some(steps) => Some(steps),
            None => {
                return TierOutcome::LowConfidence(format!(
                    "{}: answer is not an ordered list of steps",
                    backend
                ))
            }
        }
    } else {
        None
    };

    TierOutcome::Usable(Answer {
        text,
        steps,
        score,
        inference_time,
        backend: backend.to_string(),
    })
}
