// Request framing
//
// One JSON object per line. The wire form is loose (aliases, optional fields)
// so it is first read into `RawRequest`, then converted into a typed `Request`
// whose `Command` is matched exhaustively by the dispatcher.

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::DaemonError;

/// Semantic operations that go through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ask,
    Shell,
    Observe,
    Plan,
    Research,
    CommitKnowledge,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ask => "ask",
            Action::Shell => "shell",
            Action::Observe => "observe",
            Action::Plan => "plan",
            Action::Research => "research",
            Action::CommitKnowledge => "commitkb",
        }
    }

    /// Whether answers to this action may be served from and stored in the cache
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Action::Ask | Action::Research | Action::Plan)
    }
}

/// Session-management and direct-execution pseudo-actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    CreateSession,
    CloseSession,
    Status,
    Exec,
    Generate,
    Cancel,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::CreateSession => "create_session",
            Control::CloseSession => "close_session",
            Control::Status => "status",
            Control::Exec => "exec",
            Control::Generate => "generate",
            Control::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Action(Action),
    Control(Control),
}

impl Command {
    /// Case-insensitive lookup of a wire name (`commitKB`, `abort` and friends included)
    pub fn parse(name: &str) -> Option<Command> {
        let lowered = name.trim().to_ascii_lowercase();
        let cmd = match lowered.as_str() {
            "ask" => Command::Action(Action::Ask),
            "shell" => Command::Action(Action::Shell),
            "observe" => Command::Action(Action::Observe),
            "plan" => Command::Action(Action::Plan),
            "research" => Command::Action(Action::Research),
            "commitkb" | "commit_kb" | "commit_knowledge" => {
                Command::Action(Action::CommitKnowledge)
            }
            "create_session" => Command::Control(Control::CreateSession),
            "close_session" => Command::Control(Control::CloseSession),
            "status" => Command::Control(Control::Status),
            "exec" => Command::Control(Control::Exec),
            "generate" => Command::Control(Control::Generate),
            "cancel" | "abort" => Command::Control(Control::Cancel),
            _ => return None,
        };
        Some(cmd)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Action(a) => a.as_str(),
            Command::Control(c) => c.as_str(),
        }
    }
}

/// Loose wire form of a request line
#[derive(Debug, Default, Deserialize)]
pub struct RawRequest {
    #[serde(default, alias = "type")]
    pub action: Option<String>,
    #[serde(default)]
    pub action_id: Option<Value>,
    #[serde(default, alias = "prompt", alias = "command", alias = "query")]
    pub input: Option<String>,
    #[serde(default)]
    pub model_hint: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// A framed request, immutable once parsed
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub action_id: String,
    pub input: String,
    pub model_hint: Option<String>,
    pub session_id: Option<String>,
    pub params: Map<String, Value>,
    /// action_id to stop (cancel only)
    pub target: Option<String>,
    pub timestamp: Option<String>,
}

impl Request {
    pub fn new(command: Command, input: impl Into<String>) -> Self {
        Self {
            command,
            action_id: Uuid::new_v4().to_string(),
            input: input.into(),
            model_hint: None,
            session_id: None,
            params: Map::new(),
            target: None,
            timestamp: None,
        }
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Why a line could not become a `Request`
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Set when the line was valid JSON and carried an id
    pub action_id: Option<String>,
    pub error: DaemonError,
    /// True when the line was not JSON at all (counts toward the malformed limit)
    pub malformed: bool,
}

impl TryFrom<RawRequest> for Request {
    type Error = Rejection;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let action_id = match raw.action_id {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(Rejection {
                    action_id: None,
                    error: DaemonError::Protocol(format!(
                        "action_id must be a string, got {}",
                        other
                    )),
                    malformed: false,
                })
            }
        };

        let reject = |msg: String| Rejection {
            action_id: action_id.clone(),
            error: DaemonError::Protocol(msg),
            malformed: false,
        };

        let name = raw
            .action
            .ok_or_else(|| reject("missing 'action' field".to_string()))?;
        let command =
            Command::parse(&name).ok_or_else(|| reject(format!("unknown action '{}'", name)))?;

        let params = match raw.params {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(reject("'params' must be an object".to_string())),
        };

        let timestamp = raw.timestamp.map(|t| match t {
            Value::String(s) => s,
            other => other.to_string(),
        });

        Ok(Request {
            command,
            action_id: action_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            input: raw.input.unwrap_or_default(),
            model_hint: raw.model_hint,
            session_id: raw.session_id.filter(|s| !s.trim().is_empty()),
            params,
            target: raw.target,
            timestamp,
        })
    }
}

/// Parse one framed line.
pub fn parse_line(line: &str) -> Result<Request, Rejection> {
    let raw: RawRequest = serde_json::from_str(line).map_err(|e| {
        let preview: String = line.chars().take(80).collect();
        Rejection {
            action_id: None,
            error: DaemonError::Protocol(format!("malformed JSON ({}): {}", e, preview)),
            malformed: true,
        }
    })?;
    Request::try_from(raw)
}
