// Action pipeline and escalation
//
// ask, plan and research climb the tier chain (cache, local model with
// memory, local team, online supervisor) until one tier produces a usable
// answer. shell, observe and commitkb are answered locally, as are the exec
// and generate pseudo-actions. Every attempt is bounded by
// min(tier timeout, remaining request budget).

mod cache;
mod confidence;
mod local;
mod plan;
mod prompt;
mod supervisor;
mod team;
mod tier;

pub use cache::{CacheTier, CachedAnswer, ResponseCache};
pub use confidence::Confidence;
pub use local::LocalMemoryTier;
pub use plan::parse_steps;
pub use supervisor::SupervisorTier;
pub use team::{TeamMember, TeamTier};
pub use tier::{judge, Answer, EscalationTier, TierContext, TierHandler, TierOutcome};

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, EscalationConfig};
use crate::errors::{DaemonError, MemoryError};
use crate::inference::{self, GenerationParams, Generate};
use crate::memory::{KnowledgeStore, MemoryHit, MemoryKind};
use crate::metrics::Metrics;
use crate::monitoring::SystemSnapshot;
use crate::protocol::{Action, Command, Control, Event, EventSink, Request};
use crate::session::SessionSnapshot;
use crate::shell::{self, ShellRunner};

/// Slack allowed past a tier deadline before the attempt is abandoned
const TIER_GRACE: Duration = Duration::from_millis(100);

/// Processes listed in an observe snapshot
const TOP_PROCESSES: usize = 5;

/// Phrases that turn `observe` into an interpretation request
const INTERPRET_HINTS: &[&str] = &[
    "?", "why", "explain", "analy", "diagnos", "what's wrong", "por que", "porque", "explica",
    "analis",
];

/// Final outcome of one action, turned into the `result` event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Tier that produced the answer; `None` for actions that never escalate
    pub tier: Option<EscalationTier>,
    pub inference_time: Option<Duration>,
    pub steps: Option<Vec<String>>,
    pub exit_code: Option<i32>,
    pub stderr: Option<String>,
    pub data: Option<Value>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// `tier_used` wire value
    pub fn tier_code(&self) -> &'static str {
        self.tier.map(|t| t.code()).unwrap_or("N/A")
    }

    pub fn into_event(self, action_id: &str) -> Event {
        let tier = self.tier_code();
        let mut event = Event::result(action_id, self.text).with_tier(tier);
        if let Some(elapsed) = self.inference_time {
            event = event.with_inference_time(elapsed.as_millis() as u64);
        }
        if let Some(steps) = self.steps {
            event = event.with_steps(steps);
        }
        if let Some(code) = self.exit_code {
            event = event.with_exit_code(code);
        }
        if let Some(stderr) = self.stderr {
            event = event.with_stderr(stderr);
        }
        if let Some(data) = self.data {
            event = event.with_data(data);
        }
        event
    }
}

pub struct Pipeline {
    escalation: EscalationConfig,
    multiturn: bool,
    context_limit: usize,
    memory_timeout: Duration,
    tiers: Vec<Arc<dyn TierHandler>>,
    cache: Option<Arc<ResponseCache>>,
    executor: Arc<dyn Generate>,
    memory: Arc<dyn KnowledgeStore>,
    shell: ShellRunner,
    params: GenerationParams,
    metrics: Metrics,
}

impl Pipeline {
    /// Build the standard tier chain from `config`.
    pub fn new(
        config: &Config,
        executor: Arc<dyn Generate>,
        memory: Arc<dyn KnowledgeStore>,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let escalation = config.escalation.clone();
        let confidence = Arc::new(Confidence::from_config(&escalation));
        let params = GenerationParams::from_config(&config.inference);
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::from_config(&config.cache)));

        let mut tiers: Vec<Arc<dyn TierHandler>> = Vec::with_capacity(4);
        if let Some(cache) = &cache {
            tiers.push(Arc::new(CacheTier::new(cache.clone(), escalation.cache_timeout())));
        }
        tiers.push(Arc::new(LocalMemoryTier::new(
            executor.clone(),
            memory.clone(),
            params.clone(),
            confidence.clone(),
            escalation.local_timeout(),
            config.memory.context_limit,
        )));
        tiers.push(Arc::new(
            TeamTier::from_config(
                &config.team,
                escalation.team_policy,
                confidence.clone(),
                escalation.team_timeout(),
            )?
            .with_limits(config.inference.max_tokens, config.inference.temperature),
        ));
        tiers.push(Arc::new(SupervisorTier::from_config(
            config.supervisor.as_ref(),
            confidence,
            escalation.supervisor_timeout(),
        )?));

        let pipeline = Self {
            escalation,
            multiturn: config.inference.multiturn,
            context_limit: config.memory.context_limit,
            memory_timeout: Duration::from_secs(config.memory.timeout_secs.max(1)),
            tiers,
            cache,
            executor,
            memory,
            shell: ShellRunner::from_config(&config.shell),
            params,
            metrics,
        };
        info!(
            tiers = %pipeline.tier_codes().join(","),
            executor = pipeline.executor.name(),
            memory = pipeline.memory.name(),
            "pipeline ready"
        );
        Ok(pipeline)
    }

    /// Replace the escalation chain. Handlers are kept in tier order.
    pub fn with_tiers(mut self, mut tiers: Vec<Arc<dyn TierHandler>>) -> Self {
        tiers.sort_by_key(|t| t.tier());
        self.tiers = tiers;
        self
    }

    fn tier_codes(&self) -> Vec<&'static str> {
        self.tiers
            .iter()
            .filter(|t| t.is_available())
            .map(|t| t.tier().code())
            .collect()
    }

    /// Tier availability and backend names, for `status`
    pub fn describe(&self) -> Value {
        let tiers: Vec<Value> = self
            .tiers
            .iter()
            .map(|t| {
                json!({
                    "tier": t.tier().code(),
                    "name": t.tier().name(),
                    "available": t.is_available(),
                    "timeout_ms": t.timeout().as_millis() as u64,
                })
            })
            .collect();
        json!({
            "tiers": tiers,
            "executor": self.executor.name(),
            "memory": self.memory.name(),
            "cache_entries": self.cache.as_ref().map(|c| c.len()).unwrap_or(0),
            "request_budget_ms": self.escalation.request_budget().as_millis() as u64,
        })
    }

    /// Run one action or direct-execution request to completion.
    ///
    /// Partial output goes to `sink`; the returned value becomes the single
    /// terminal `result` event. Cancellation is observed through the sink's
    /// token.
    pub async fn run(
        &self,
        request: &Request,
        session: Option<&SessionSnapshot>,
        sink: &EventSink,
    ) -> Result<Completion, DaemonError> {
        let started = Instant::now();
        let outcome = match request.command {
            Command::Action(action @ (Action::Ask | Action::Plan)) => {
                let input = require_input(request)?;
                let ctx = self.context(action, input, request, session);
                self.escalate(ctx, started, sink.cancel_token()).await
            }
            Command::Action(Action::Research) => self.research(request, session, sink, started).await,
            Command::Action(Action::Observe) => self.observe(request, session, sink, started).await,
            Command::Action(Action::Shell) => self.shell(request, sink).await,
            Command::Action(Action::CommitKnowledge) => self.commit_knowledge(request).await,
            Command::Control(Control::Exec) => self.exec(request, sink).await,
            Command::Control(Control::Generate) => self.generate(request, sink).await,
            Command::Control(other) => Err(DaemonError::Internal(format!(
                "{} is handled by the connection",
                other.as_str()
            ))),
        };

        if let Ok(completion) = &outcome {
            self.metrics.record_result(completion.tier_code());
        }
        outcome
    }

    fn context<'a>(
        &self,
        action: Action,
        prompt: &'a str,
        request: &'a Request,
        session: Option<&'a SessionSnapshot>,
    ) -> TierContext<'a> {
        TierContext {
            action,
            prompt,
            session,
            research: &[],
            observation: None,
            model_hint: request.model_hint.as_deref(),
            multiturn: self.multiturn || request.param_bool("multiturn"),
            deadline: Duration::ZERO,
        }
    }

    /// Climb the tier chain until a usable answer, the budget, or cancellation.
    async fn escalate(
        &self,
        base: TierContext<'_>,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<Completion, DaemonError> {
        let budget = self.escalation.request_budget();
        let mut failures: Vec<String> = Vec::new();

        for handler in self.tiers.iter().filter(|t| t.is_available()) {
            let tier = handler.tier();
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                failures.push(format!("request budget of {:?} exhausted", budget));
                break;
            }

            let deadline = handler.timeout().min(remaining);
            let ctx = TierContext {
                deadline,
                ..base.clone()
            };
            debug!(tier = tier.code(), deadline = ?deadline, "attempting tier");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DaemonError::Cancelled),
                outcome = tokio::time::timeout(deadline + TIER_GRACE, handler.attempt(&ctx)) => {
                    outcome.unwrap_or_else(|_| {
                        TierOutcome::HardFailure(DaemonError::Timeout(deadline))
                    })
                }
            };

            match outcome {
                TierOutcome::Usable(answer) => {
                    debug!(tier = tier.code(), backend = %answer.backend, "usable answer");
                    if tier > EscalationTier::Cache && ctx.cacheable() {
                        if let Some(cache) = &self.cache {
                            cache.insert(ctx.action, ctx.prompt, &answer.text, answer.steps.clone());
                        }
                    }
                    return Ok(Completion {
                        text: answer.text,
                        tier: Some(tier),
                        inference_time: Some(answer.inference_time),
                        steps: answer.steps,
                        ..Default::default()
                    });
                }
                TierOutcome::LowConfidence(reason) => {
                    debug!(tier = tier.code(), reason = %reason, "escalating");
                    failures.push(format!("{}: {}", tier.code(), reason));
                }
                TierOutcome::HardFailure(err) => {
                    warn!(tier = tier.code(), error = %err, "tier failed, escalating");
                    self.metrics.record_inference_failure(err.kind());
                    failures.push(format!("{}: {}", tier.code(), err));
                }
            }
            self.metrics.record_escalation(tier.code());
        }

        info!(
            action = base.action.as_str(),
            attempts = failures.len(),
            "no tier produced a usable answer"
        );
        Err(DaemonError::Exhausted(if failures.is_empty() {
            "no tier is available".to_string()
        } else {
            failures.join("; ")
        }))
    }

    async fn research(
        &self,
        request: &Request,
        session: Option<&SessionSnapshot>,
        sink: &EventSink,
        started: Instant,
    ) -> Result<Completion, DaemonError> {
        let input = require_input(request)?;
        let hits = self.search_memory(input).await;

        let mut ctx = self.context(Action::Research, input, request, session);
        ctx.research = &hits;
        let mut completion = self.escalate(ctx, started, sink.cancel_token()).await?;

        if !hits.is_empty() {
            let references: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
            completion.data = Some(json!({ "references": references }));
        }
        Ok(completion)
    }

    /// Knowledge search before a research escalation. Failures cost context only.
    async fn search_memory(&self, query: &str) -> Vec<MemoryHit> {
        let search = self.memory.search(query, self.context_limit.max(1));
        match tokio::time::timeout(self.memory_timeout, search).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!(error = %e, "knowledge search failed, continuing without references");
                Vec::new()
            }
            Err(_) => {
                warn!("knowledge search timed out, continuing without references");
                Vec::new()
            }
        }
    }

    async fn observe(
        &self,
        request: &Request,
        session: Option<&SessionSnapshot>,
        sink: &EventSink,
        started: Instant,
    ) -> Result<Completion, DaemonError> {
        let snapshot = tokio::task::spawn_blocking(|| SystemSnapshot::collect(TOP_PROCESSES))
            .await
            .map_err(|e| DaemonError::Internal(format!("system snapshot failed: {}", e)))?;
        let summary = snapshot.summary();
        let data = serde_json::to_value(&snapshot)
            .map_err(|e| DaemonError::Internal(format!("snapshot encoding failed: {}", e)))?;

        let input = request.input.trim();
        if !wants_interpretation(input) {
            return Ok(Completion {
                text: summary,
                data: Some(data),
                ..Default::default()
            });
        }

        let mut ctx = self.context(Action::Ask, input, request, session);
        ctx.observation = Some(summary.as_str());
        let mut completion = self.escalate(ctx, started, sink.cancel_token()).await?;
        completion.data = Some(data);
        Ok(completion)
    }

    /// Natural language is translated to a command by the local model in a
    /// single pass; input that already resolves to a command runs as is.
    async fn shell(&self, request: &Request, sink: &EventSink) -> Result<Completion, DaemonError> {
        let input = require_input(request)?;
        if shell::resolves_directly(input) {
            return self.run_command(input, None, None, sink).await;
        }

        let deadline = self
            .escalation
            .local_timeout()
            .min(self.escalation.request_budget());
        let params = self.params.clone().with_model_hint(request.model_hint.as_deref());
        let prompt = shell::translation_prompt(input);

        let (reply, elapsed) = tokio::select! {
            biased;
            _ = sink.cancel_token().cancelled() => return Err(DaemonError::Cancelled),
            res = inference::invoke(self.executor.as_ref(), &prompt, &params, deadline) => res?,
        };
        let command = shell::extract_command(&reply).ok_or_else(|| {
            DaemonError::Validation("could not translate the request into a command".to_string())
        })?;
        info!(request = %input, command = %command, "translated shell request");
        sink.partial(format!("$ {}\n", command)).await;

        self.run_command(&command, Some(EscalationTier::LocalMemory), Some(elapsed), sink)
            .await
    }

    async fn exec(&self, request: &Request, sink: &EventSink) -> Result<Completion, DaemonError> {
        let input = require_input(request)?;
        self.run_command(input, None, None, sink).await
    }

    async fn run_command(
        &self,
        command: &str,
        tier: Option<EscalationTier>,
        inference_time: Option<Duration>,
        sink: &EventSink,
    ) -> Result<Completion, DaemonError> {
        let output = self.shell.run(command, Some(sink), sink.cancel_token()).await?;
        Ok(Completion {
            text: output.stdout,
            tier,
            inference_time,
            exit_code: Some(output.exit_code),
            stderr: (!output.stderr.is_empty()).then_some(output.stderr),
            data: Some(json!({
                "command": command,
                "truncated": output.truncated,
            })),
            ..Default::default()
        })
    }

    /// Raw generation, no escalation
    async fn generate(&self, request: &Request, sink: &EventSink) -> Result<Completion, DaemonError> {
        let input = require_input(request)?;
        let mut params = self.params.clone().with_model_hint(request.model_hint.as_deref());
        if let Some(max_tokens) = request.params.get("max_tokens").and_then(Value::as_u64) {
            params.max_tokens = max_tokens.min(u32::MAX as u64) as u32;
        }
        if let Some(temperature) = request.params.get("temperature").and_then(Value::as_f64) {
            params.temperature = temperature as f32;
        }

        let deadline = self
            .escalation
            .local_timeout()
            .min(self.escalation.request_budget());
        let (text, elapsed) = tokio::select! {
            biased;
            _ = sink.cancel_token().cancelled() => return Err(DaemonError::Cancelled),
            res = inference::invoke(self.executor.as_ref(), input, &params, deadline) => res?,
        };
        Ok(Completion {
            text,
            inference_time: Some(elapsed),
            ..Default::default()
        })
    }

    async fn commit_knowledge(&self, request: &Request) -> Result<Completion, DaemonError> {
        let content = require_input(request)?;
        let kind = match request.param_str("kind") {
            Some(name) => MemoryKind::parse(name).ok_or_else(|| {
                DaemonError::Validation(format!("unknown memory kind '{}'", name))
            })?,
            None => MemoryKind::Knowledge,
        };

        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("commitkb"));
        metadata.insert("action_id".to_string(), json!(request.action_id));
        if let Some(session_id) = &request.session_id {
            metadata.insert("session_id".to_string(), json!(session_id));
        }
        if let Some(tags) = request.params.get("tags") {
            metadata.insert("tags".to_string(), tags.clone());
        }

        let store = self.memory.store(content, kind, metadata);
        let id = tokio::time::timeout(self.memory_timeout, store)
            .await
            .map_err(|_| {
                MemoryError::StoreUnavailable(format!("timed out after {:?}", self.memory_timeout))
            })??;

        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!(id = %id, kind = kind.as_str(), "knowledge committed");
        Ok(Completion {
            text: id.clone(),
            data: Some(json!({ "id": id, "kind": kind.as_str() })),
            ..Default::default()
        })
    }
}

fn require_input(request: &Request) -> Result<&str, DaemonError> {
    let input = request.input.trim();
    if input.is_empty() {
        return Err(DaemonError::Validation(format!(
            "{} requires a non-empty input",
            request.command.as_str()
        )));
    }
    Ok(input)
}

fn wants_interpretation(input: &str) -> bool {
    let lowered = input.to_lowercase();
    !lowered.is_empty() && INTERPRET_HINTS.iter().any(|h| lowered.contains(h))
}
