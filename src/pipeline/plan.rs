// Plan output parsing
//
// Accepted shapes:
//   - a JSON array of strings or step objects
//   - a JSON object with a `steps` array
//   - a numbered or bulleted list with at least two items
// Step objects may use `description`/`descricao`/`step`/`title` for the text
// and `command`/`comando` for an optional command.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn list_item() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:\d+\s*[.):-]|[-*•]|step\s+\d+\s*[:.)-])\s+(.+?)\s*$")
            .expect("valid regex")
    })
}

/// Parse model output into ordered steps, or `None` if it has no step structure.
pub fn parse_steps(text: &str) -> Option<Vec<String>> {
    let body = strip_fences(text);

    if let Some(steps) = parse_json(&body) {
        return Some(steps);
    }

    let steps: Vec<String> = body
        .lines()
        .filter_map(|line| {
            list_item()
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .filter(|s| !s.is_empty())
        .collect();

    (steps.len() >= 2).then_some(steps)
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_json(body: &str) -> Option<Vec<String>> {
    let trimmed = body.trim();
    let value = serde_json::from_str::<Value>(trimmed)
        .ok()
        .or_else(|| slice_between(trimmed, '[', ']'))
        .or_else(|| slice_between(trimmed, '{', '}'))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("steps") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    let steps: Vec<String> = items.iter().filter_map(step_text).collect();
    (!steps.is_empty()).then_some(steps)
}

fn slice_between(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn step_text(item: &Value) -> Option<String> {
    match item {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(obj) => {
            let text = ["description", "descricao", "step", "title", "action"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty());
            let command = ["command", "comando", "cmd"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty());
            match (text, command) {
                (Some(t), Some(c)) => Some(format!("{}: {}", t, c)),
                (Some(t), None) => Some(t.to_string()),
                (None, Some(c)) => Some(c.to_string()),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_array_of_objects() {
        let text = r#"[{"descricao":"Check disk","comando":"df -h"},{"description":"Clean cache"}]"#;
        assert_eq!(
            parse_steps(text).unwrap(),
            vec!["Check disk: df -h".to_string(), "Clean cache".to_string()]
        );
    }

    #[test]
    fn test_json_inside_prose_and_fences() {
        let text = "Here is the plan:\n```json\n[\"stop service\", \"rotate logs\"]\n```\nGood luck.";
        assert_eq!(parse_steps(text).unwrap().len(), 2);
    }

    #[test]
    fn test_steps_object() {
        let text = r#"{"steps":["backup","upgrade","reboot"]}"#;
        assert_eq!(parse_steps(text).unwrap()[2], "reboot");
    }

    #[test]
    fn test_numbered_and_bulleted_lists() {
        let numbered = "Plan:\n1. Stop nginx\n2) Edit nginx.conf\n3 - Start nginx";
        assert_eq!(
            parse_steps(numbered).unwrap(),
            vec!["Stop nginx", "Edit nginx.conf", "Start nginx"]
        );
        let bullets = "- update packages\n* restart\n";
        assert_eq!(parse_steps(bullets).unwrap().len(), 2);
    }

    #[test]
    fn test_single_item_or_prose_is_rejected() {
        assert!(parse_steps("1. only one thing").is_none());
        assert!(parse_steps("You should probably restart it.").is_none());
        assert!(parse_steps("[]").is_none());
        assert!(parse_steps(r#"{"answer":"no"}"#).is_none());
    }
}
