// N3: team of local specialists
//
// Every specialist gets the request concurrently. With the `ranked` policy
// the highest-scoring usable answer wins (ties go to the specialist listed
// first); with `first_usable` the first usable answer to arrive wins and the
// rest are dropped.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::confidence::Confidence;
use super::prompt;
use super::tier::{judge, Answer, EscalationTier, TierContext, TierHandler, TierOutcome};
use crate::config::{SpecialistEntry, TeamPolicy};
use crate::errors::{DaemonError, InferenceError};
use crate::providers::{ChatRequest, LlmProvider, OpenAIProvider};

/// One specialist of the team
pub struct TeamMember {
    pub role: String,
    pub provider: Arc<dyn LlmProvider>,
    pub instructions: String,
}

impl TeamMember {
    pub fn new(role: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let role = role.into();
        let instructions = role_instructions(&role).to_string();
        Self {
            role,
            provider,
            instructions,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// Default instructions for the well-known roles
fn role_instructions(role: &str) -> &'static str {
    let role = role.to_lowercase();
    if role.contains("manager") || role.contains("gerente") {
        "You coordinate the team. Give the overall approach and the order of work."
    } else if role.contains("analyst") || role.contains("analista") {
        "You are the analyst. Diagnose the situation and explain causes and risks."
    } else if role.contains("coder") || role.contains("programador") || role.contains("developer") {
        "You are the engineer. Give exact commands, config snippets or code."
    } else {
        "You are a specialist on this team. Give your best complete answer."
    }
}

pub struct TeamTier {
    members: Vec<TeamMember>,
    policy: TeamPolicy,
    confidence: Arc<Confidence>,
    timeout: Duration,
    max_tokens: u32,
    temperature: f32,
}

impl TeamTier {
    pub fn new(
        members: Vec<TeamMember>,
        policy: TeamPolicy,
        confidence: Arc<Confidence>,
        timeout: Duration,
    ) -> Self {
        Self {
            members,
            policy,
            confidence,
            timeout,
            max_tokens: 1024,
            temperature: 0.3,
        }
    }

    /// Build one OpenAI-compatible client per configured specialist.
    pub fn from_config(
        entries: &[SpecialistEntry],
        policy: TeamPolicy,
        confidence: Arc<Confidence>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut members = Vec::with_capacity(entries.len());
        for entry in entries {
            let provider = OpenAIProvider::new(
                entry.name.clone(),
                entry.base_url.clone(),
                entry.model.clone(),
                entry.api_key.clone(),
            )?;
            let mut member = TeamMember::new(entry.name.clone(), Arc::new(provider));
            if let Some(instructions) = &entry.system_prompt {
                member = member.with_instructions(instructions.clone());
            }
            members.push(member);
        }
        if !members.is_empty() {
            info!(
                specialists = members.len(),
                policy = ?policy,
                "team tier configured"
            );
        }
        Ok(Self::new(members, policy, confidence, timeout))
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl TierHandler for TeamTier {
    fn tier(&self) -> EscalationTier {
        EscalationTier::LocalTeam
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_available(&self) -> bool {
        !self.members.is_empty()
    }

    async fn attempt(&self, ctx: &TierContext<'_>) -> TierOutcome {
        let system = prompt::system_prompt(ctx, ctx.research);
        let user = prompt::user_prompt(ctx, ctx.research);
        let deadline = ctx.deadline;

        let mut pending: FuturesUnordered<_> = self
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let request = ChatRequest::new(user.clone())
                    .with_system(format!("{}\n\n{}", system, member.instructions))
                    .with_limits(self.max_tokens, self.temperature);
                async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(deadline, member.provider.complete(&request)).await;
                    (index, started.elapsed(), result)
                }
            })
            .collect();

        let mut best: Option<(usize, Answer)> = None;
        let mut soft = Vec::new();
        let mut hard = Vec::new();
        let mut timeouts = 0usize;

        while let Some((index, elapsed, result)) = pending.next().await {
            let role = &self.members[index].role;
            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(role = %role, error = %e, "specialist failed");
                    hard.push(format!("{}: {:#}", role, e));
                    continue;
                }
                Err(_) => {
                    debug!(role = %role, "specialist timed out");
                    timeouts += 1;
                    hard.push(format!("{}: timed out after {:?}", role, deadline));
                    continue;
                }
            };

            match judge(ctx, &self.confidence, response.text.trim().to_string(), elapsed, role) {
                TierOutcome::Usable(answer) => {
                    if self.policy == TeamPolicy::FirstUsable {
                        return TierOutcome::Usable(answer);
                    }
                    let better = match &best {
                        None => true,
                        Some((best_index, current)) => {
                            answer.score > current.score
                                || (answer.score == current.score && index < *best_index)
                        }
                    };
                    if better {
                        best = Some((index, answer));
                    }
                }
                TierOutcome::LowConfidence(reason) => soft.push(reason),
                TierOutcome::HardFailure(e) => hard.push(format!("{}: {}", role, e)),
            }
        }

        if let Some((_, answer)) = best {
            debug!(role = %answer.backend, score = answer.score, "team answer selected");
            return TierOutcome::Usable(answer);
        }

        if !soft.is_empty() {
            soft.extend(hard);
            return TierOutcome::LowConfidence(soft.join("; "));
        }
        if timeouts == self.members.len() {
            return TierOutcome::HardFailure(DaemonError::Inference(InferenceError::Timeout(deadline)));
        }
        TierOutcome::HardFailure(DaemonError::Inference(InferenceError::ProcessFailure(
            hard.join("; "),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscalationConfig;
    use crate::protocol::Action;
    use crate::providers::testing::ScriptedProvider;

    fn team(members: Vec<(&str, ScriptedProvider)>, policy: TeamPolicy) -> TeamTier {
        TeamTier::new(
            members
                .into_iter()
                .map(|(role, p)| TeamMember::new(role, Arc::new(p)))
                .collect(),
            policy,
            Arc::new(Confidence::from_config(&EscalationConfig::default())),
            Duration::from_secs(5),
        )
    }

    fn ctx() -> TierContext<'static> {
        TierContext {
            action: Action::Ask,
            prompt: "why is nginx returning 502?",
            session: None,
            research: &[],
            observation: None,
            model_hint: None,
            multiturn: false,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_ranked_prefers_stronger_answer() {
        let t = team(
            vec![
                ("manager", ScriptedProvider::reply("manager", "Check upstream.")),
                (
                    "analyst",
                    ScriptedProvider::reply(
                        "analyst",
                        "The upstream app server is down or refusing connections; check systemctl status app and the nginx error log.",
                    ),
                ),
            ],
            TeamPolicy::Ranked,
        );
        match t.attempt(&ctx()).await {
            TierOutcome::Usable(a) => assert_eq!(a.backend, "analyst"),
            other => panic!("expected usable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ranked_tie_goes_to_first_listed() {
        let t = team(
            vec![
                ("manager", ScriptedProvider::reply("manager", "restart it").with_delay(Duration::from_millis(50))),
                ("coder", ScriptedProvider::reply("coder", "reboot it!")),
            ],
            TeamPolicy::Ranked,
        );
        match t.attempt(&ctx()).await {
            TierOutcome::Usable(a) => assert_eq!(a.backend, "manager"),
            other => panic!("expected usable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_usable_does_not_wait_for_slow_members() {
        let t = team(
            vec![
                ("manager", ScriptedProvider::reply("manager", "slow but long answer").with_delay(Duration::from_secs(4))),
                ("coder", ScriptedProvider::reply("coder", "systemctl restart app")),
            ],
            TeamPolicy::FirstUsable,
        );
        let started = tokio::time::Instant::now();
        match t.attempt(&ctx()).await {
            TierOutcome::Usable(a) => assert_eq!(a.backend, "coder"),
            other => panic!("expected usable, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_low_confidence_when_nobody_knows() {
        let t = team(
            vec![
                ("manager", ScriptedProvider::reply("manager", "I don't know.")),
                ("coder", ScriptedProvider::fail("coder", "connection refused")),
            ],
            TeamPolicy::Ranked,
        );
        match t.attempt(&ctx()).await {
            TierOutcome::LowConfidence(reason) => {
                assert!(reason.contains("manager"));
                assert!(reason.contains("connection refused"));
            }
            other => panic!("expected low confidence, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_timeouts_is_timeout_failure() {
        let t = team(
            vec![("manager", ScriptedProvider::reply("manager", "late").with_delay(Duration::from_secs(60)))],
            TeamPolicy::Ranked,
        );
        match t.attempt(&ctx()).await {
            TierOutcome::HardFailure(e) => assert_eq!(e.kind(), "Timeout"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_team_is_unavailable() {
        let t = team(vec![], TeamPolicy::Ranked);
        assert!(!t.is_available());
        assert!(role_instructions("Analista").contains("analyst"));
    }
}
