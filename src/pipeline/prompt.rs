// Prompt composition shared by the model-backed tiers

use super::tier::TierContext;
use crate::memory::{MemoryHit, MemoryKind};
use crate::protocol::Action;

const BASE_SYSTEM: &str = "You are FazAI, a Linux system administration assistant running \
on this host. Answer precisely and concisely. Prefer concrete commands and file paths.";

const PLAN_INSTRUCTIONS: &str = "Reply ONLY with a JSON array of steps. Each step is an \
object with a \"description\" and, when a command applies, a \"command\".";

const RESEARCH_INSTRUCTIONS: &str = "Use the reference notes when they are relevant and say \
which parts of the answer come from them.";

const OBSERVE_INSTRUCTIONS: &str = "Interpret the observed system state for the user. Point \
out anything abnormal.";

/// Longest transcript excerpt per exchange side
const EXCERPT_CHARS: usize = 600;

/// System prompt for `ctx`, with personality memories appended.
pub fn system_prompt(ctx: &TierContext<'_>, hits: &[MemoryHit]) -> String {
    let mut system = BASE_SYSTEM.to_string();

    match ctx.action {
        Action::Plan => push_block(&mut system, PLAN_INSTRUCTIONS),
        Action::Research => push_block(&mut system, RESEARCH_INSTRUCTIONS),
        _ if ctx.observation.is_some() => push_block(&mut system, OBSERVE_INSTRUCTIONS),
        _ => {}
    }

    let persona: Vec<&str> = hits
        .iter()
        .filter(|h| h.kind == MemoryKind::Personality)
        .map(|h| h.content.as_str())
        .collect();
    if !persona.is_empty() {
        system.push_str("\n\nThings to keep in mind about this user and host:");
        for line in persona {
            system.push_str("\n- ");
            system.push_str(line.trim());
        }
    }
    system
}

/// User prompt for `ctx`: transcript, observation, knowledge snippets, request.
pub fn user_prompt(ctx: &TierContext<'_>, hits: &[MemoryHit]) -> String {
    let mut prompt = String::new();

    if ctx.multiturn {
        if let Some(session) = ctx.session.filter(|s| !s.transcript.is_empty()) {
            prompt.push_str("Previous conversation:\n");
            for exchange in &session.transcript {
                prompt.push_str(&format!(
                    "User: {}\nAssistant: {}\n",
                    excerpt(&exchange.request),
                    excerpt(&exchange.response)
                ));
            }
            prompt.push('\n');
        }
    }

    if let Some(observation) = ctx.observation {
        prompt.push_str("Observed system state:\n");
        prompt.push_str(observation.trim());
        prompt.push_str("\n\n");
    }

    let notes: Vec<&MemoryHit> = hits
        .iter()
        .filter(|h| h.kind != MemoryKind::Personality)
        .collect();
    if !notes.is_empty() {
        prompt.push_str("Reference notes:\n");
        for note in notes {
            prompt.push_str(&format!("- {}\n", note.content.trim()));
        }
        prompt.push('\n');
    }

    prompt.push_str("Request: ");
    prompt.push_str(ctx.prompt.trim());
    prompt
}

/// Single text prompt for backends without a system role (the local worker)
pub fn flatten(system: &str, user: &str) -> String {
    format!("{}\n\n{}\n\nAnswer:", system, user)
}

fn push_block(target: &mut String, block: &str) {
    target.push_str("\n\n");
    target.push_str(block);
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Exchange, SessionSnapshot};
    use chrono::Utc;
    use std::time::Duration;

    fn ctx<'a>(action: Action, prompt: &'a str) -> TierContext<'a> {
        TierContext {
            action,
            prompt,
            session: None,
            research: &[],
            observation: None,
            model_hint: None,
            multiturn: false,
            deadline: Duration::from_secs(1),
        }
    }

    fn hit(content: &str, kind: MemoryKind) -> MemoryHit {
        MemoryHit {
            content: content.to_string(),
            kind,
            score: 0.9,
        }
    }

    #[test]
    fn test_plan_system_prompt_asks_for_steps() {
        let system = system_prompt(&ctx(Action::Plan, "upgrade"), &[]);
        assert!(system.contains("JSON array of steps"));
    }

    #[test]
    fn test_memories_are_split_by_kind() {
        let hits = vec![
            hit("user prefers apt over snap", MemoryKind::Personality),
            hit("nginx config lives in /etc/nginx/sites-enabled", MemoryKind::Knowledge),
        ];
        let c = ctx(Action::Research, "where is the nginx config?");
        let system = system_prompt(&c, &hits);
        let user = user_prompt(&c, &hits);

        assert!(system.contains("prefers apt"));
        assert!(!system.contains("sites-enabled"));
        assert!(user.contains("Reference notes:\n- nginx config lives"));
        assert!(user.ends_with("Request: where is the nginx config?"));
    }

    #[test]
    fn test_transcript_only_when_multiturn() {
        let session = SessionSnapshot {
            id: "s1".into(),
            created_at: Utc::now(),
            transcript: vec![Exchange::new("ask", "what is my ip?", "10.0.0.5")],
            last_tier: None,
            params: Default::default(),
        };
        let mut c = ctx(Action::Ask, "and the gateway?");
        c.session = Some(&session);
        assert!(!user_prompt(&c, &[]).contains("10.0.0.5"));

        c.multiturn = true;
        let user = user_prompt(&c, &[]);
        assert!(user.starts_with("Previous conversation:\nUser: what is my ip?\nAssistant: 10.0.0.5"));
    }

    #[test]
    fn test_observation_is_included() {
        let mut c = ctx(Action::Ask, "why is it slow?");
        c.observation = Some("Load: 9.10 8.00 7.50");
        assert!(user_prompt(&c, &[]).contains("Observed system state:\nLoad: 9.10"));
        assert!(system_prompt(&c, &[]).contains("Interpret the observed system state"));
    }
}
