// One-shot protocol client used by `fazai send`

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};
use uuid::Uuid;

use crate::protocol::Event;

/// Where the daemon listens
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

/// Request as written on the wire
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub action: String,
    pub action_id: String,
    pub input: String,
    pub session_id: Option<String>,
    pub model_hint: Option<String>,
    pub target: Option<String>,
    pub params: Map<String, Value>,
}

impl OutgoingRequest {
    pub fn new(action: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            action_id: Uuid::new_v4().to_string(),
            input: input.into(),
            session_id: None,
            model_hint: None,
            target: None,
            params: Map::new(),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut obj = Map::new();
        obj.insert("action".into(), Value::String(self.action.clone()));
        obj.insert("action_id".into(), Value::String(self.action_id.clone()));
        obj.insert("input".into(), Value::String(self.input.clone()));
        if let Some(session) = &self.session_id {
            obj.insert("session_id".into(), Value::String(session.clone()));
        }
        if let Some(hint) = &self.model_hint {
            obj.insert("model_hint".into(), Value::String(hint.clone()));
        }
        if let Some(target) = &self.target {
            obj.insert("target".into(), Value::String(target.clone()));
        }
        if !self.params.is_empty() {
            obj.insert("params".into(), Value::Object(self.params.clone()));
        }
        serde_json::to_string(&Value::Object(obj)).context("Failed to encode request")
    }
}

/// Send one request and feed every event for it to `on_event` until the
/// terminal one, which is returned.
pub async fn send<F>(endpoint: &Endpoint, request: &OutgoingRequest, on_event: F) -> Result<Event>
where
    F: FnMut(&Event),
{
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .with_context(|| format!("Failed to connect to {}", path.display()))?;
            exchange(stream, request, on_event).await
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to {}", addr))?;
            exchange(stream, request, on_event).await
        }
    }
}

async fn exchange<S, F>(stream: S, request: &OutgoingRequest, mut on_event: F) -> Result<Event>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&Event),
{
    let mut framed = Framed::new(stream, LinesCodec::new());
    framed.send(request.to_line()?).await.context("Failed to send request")?;

    while let Some(line) = framed.next().await {
        let line = line.context("Failed to read from daemon")?;
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("Daemon sent an invalid event: {}", line))?;
        on_event(&event);

        let ours = match event.action_id.as_deref() {
            Some(id) => id == request.action_id,
            // Connection-level errors carry no action id
            None => true,
        };
        if ours && event.is_terminal() {
            return Ok(event);
        }
    }
    anyhow::bail!("Daemon closed the connection before answering")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_shape() {
        let mut req = OutgoingRequest::new("ask", "disk usage?");
        req.session_id = Some("s1".into());
        let value: Value = serde_json::from_str(&req.to_line().unwrap()).unwrap();
        assert_eq!(value["action"], "ask");
        assert_eq!(value["session_id"], "s1");
        assert!(value.get("params").is_none());
        assert!(value.get("target").is_none());
    }
}
