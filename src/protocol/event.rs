// Outbound events
//
// Every request produces zero or more `partial` events followed by exactly one
// terminal event (`result`, `error`, `stop`, or `done` for close_session).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Partial,
    Result,
    Error,
    Stop,
    Done,
}

impl EventType {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventType::Partial)
    }
}

/// One line written back to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Absent only for connection-level errors (malformed line, backpressure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error kind (error events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    fn bare(event_type: EventType, action_id: Option<String>) -> Self {
        Self {
            event_type,
            action_id,
            session_id: None,
            result: None,
            error: None,
            kind: None,
            tier_used: None,
            inference_time_ms: None,
            steps: None,
            exit_code: None,
            stderr: None,
            data: None,
        }
    }

    pub fn partial(action_id: &str, text: impl Into<String>) -> Self {
        let mut event = Self::bare(EventType::Partial, Some(action_id.to_string()));
        event.result = Some(text.into());
        event
    }

    pub fn result(action_id: &str, text: impl Into<String>) -> Self {
        let mut event = Self::bare(EventType::Result, Some(action_id.to_string()));
        event.result = Some(text.into());
        event
    }

    pub fn error(action_id: Option<&str>, err: &DaemonError) -> Self {
        let mut event = Self::bare(EventType::Error, action_id.map(str::to_string));
        event.error = Some(err.to_string());
        event.kind = Some(err.kind().to_string());
        event
    }

    pub fn stop(action_id: &str) -> Self {
        Self::bare(EventType::Stop, Some(action_id.to_string()))
    }

    pub fn done(action_id: &str) -> Self {
        Self::bare(EventType::Done, Some(action_id.to_string()))
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier_used = Some(tier.into());
        self
    }

    pub fn with_inference_time(mut self, ms: u64) -> Self {
        self.inference_time_ms = Some(ms);
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// Serialize as one wire line (without the trailing newline)
    pub fn to_line(&self) -> String {
        // Event holds only strings, numbers and JSON values; this cannot fail
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","error":"serialization failed: {}","kind":"Internal"}}"#,
                e
            )
        })
    }
}
