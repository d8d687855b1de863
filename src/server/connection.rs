// One client connection
//
// Reads framed request lines, answers session-management requests inline and
// runs everything else as its own task. All outbound events go through one
// bounded channel drained by a writer task, so events of one action keep
// their order and a slow reader applies backpressure to that connection
// only. Every request gets exactly one terminal event.

use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ServerState;
use crate::errors::DaemonError;
use crate::protocol::{parse_line, Command, Control, Event, EventSink, Request};
use crate::session::{Exchange, SessionSnapshot};

/// In-flight actions of a connection, by action id
type InFlight = Arc<DashMap<String, CancellationToken>>;

pub(super) async fn serve_connection<S>(stream: S, state: Arc<ServerState>, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(state.config.max_line_bytes),
    );
    let (tx, rx) = mpsc::channel::<Event>(state.config.event_buffer.max(1));
    let writer_task = tokio::spawn(write_events(writer, rx, token.clone()));

    let mut conn = Connection {
        state,
        tx,
        token,
        in_flight: Arc::new(DashMap::new()),
        default_session: None,
        malformed: 0,
    };
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = conn.token.cancelled() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            frame = frames.next() => match frame {
                None => break,
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !conn.handle_line(&line, &mut tasks).await {
                        break;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let err = DaemonError::Protocol(format!(
                        "line exceeds {} bytes",
                        conn.state.config.max_line_bytes
                    ));
                    conn.reject(None, &err).await;
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(error = %e, "read failed");
                    break;
                }
            },
        }
    }

    conn.shutdown(tasks).await;
    drop(conn);
    let _ = writer_task.await;
}

/// Drain the event channel onto the socket. A failed write cancels the
/// connection and, with it, every action still running on it.
async fn write_events<W>(writer: W, mut rx: mpsc::Receiver<Event>, token: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(event) = rx.recv().await {
        if let Err(e) = sink.send(event.to_line()).await {
            debug!(error = %e, "write failed, dropping connection");
            token.cancel();
            break;
        }
    }
}

struct Connection {
    state: Arc<ServerState>,
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    in_flight: InFlight,
    /// Session used by requests that name none; created on first use
    default_session: Option<String>,
    malformed: u32,
}

impl Connection {
    /// Handle one request line. Returns false when the connection must close.
    async fn handle_line(&mut self, line: &str, tasks: &mut JoinSet<()>) -> bool {
        match parse_line(line) {
            Ok(request) => {
                self.dispatch(request, tasks).await;
                true
            }
            Err(rejection) => {
                self.reject(rejection.action_id.as_deref(), &rejection.error).await;
                if rejection.malformed {
                    self.malformed += 1;
                    if self.malformed > self.state.config.malformed_threshold {
                        warn!(count = self.malformed, "too many malformed lines, closing connection");
                        return false;
                    }
                }
                true
            }
        }
    }

    async fn reject(&self, action_id: Option<&str>, err: &DaemonError) {
        self.state.metrics.record_error(err.kind());
        let _ = self.tx.send(Event::error(action_id, err)).await;
    }

    async fn dispatch(&mut self, request: Request, tasks: &mut JoinSet<()>) {
        self.state.metrics.record_request(request.command.as_str());

        if self.in_flight.contains_key(&request.action_id) {
            let err = DaemonError::Protocol(format!(
                "action_id '{}' is already in flight",
                request.action_id
            ));
            self.reject(Some(&request.action_id), &err).await;
            return;
        }

        match request.command {
            Command::Control(Control::CreateSession) => self.create_session(&request).await,
            Command::Control(Control::CloseSession) => self.close_session(&request).await,
            Command::Control(Control::Status) => self.status(&request).await,
            Command::Control(Control::Cancel) => self.cancel(&request).await,
            _ => self.spawn_action(request, tasks).await,
        }
    }

    async fn create_session(&self, request: &Request) {
        match self.state.sessions.create(request.params.clone()) {
            Ok(session) => {
                let event = Event::result(&request.action_id, session.id.clone())
                    .with_session(Some(&session.id))
                    .with_tier("N/A")
                    .with_data(json!({ "session_id": session.id }));
                let _ = self.tx.send(event).await;
            }
            Err(e) => self.reject(Some(&request.action_id), &e).await,
        }
    }

    async fn close_session(&mut self, request: &Request) {
        let Some(id) = request.session_id.as_deref().or(request.target.as_deref()) else {
            let err = DaemonError::Validation("close_session requires a session_id".to_string());
            self.reject(Some(&request.action_id), &err).await;
            return;
        };

        if !self.state.sessions.close(id) {
            let err = DaemonError::SessionNotFound(id.to_string());
            self.reject(Some(&request.action_id), &err).await;
            return;
        }
        if self.default_session.as_deref() == Some(id) {
            self.default_session = None;
        }
        let event = Event::done(&request.action_id).with_session(Some(id));
        let _ = self.tx.send(event).await;
    }

    async fn status(&self, request: &Request) {
        let status = self.state.status(request.param_bool("metrics"));
        let summary = format!(
            "fazai {} up {}s, {} session(s), {} connection(s)",
            env!("CARGO_PKG_VERSION"),
            self.state.uptime().as_secs(),
            self.state.sessions.len(),
            self.state.metrics.live_connections()
        );
        let event = Event::result(&request.action_id, summary)
            .with_tier("N/A")
            .with_data(status);
        let _ = self.tx.send(event).await;
    }

    /// Cancel one in-flight action (`target`), or all of them when no target
    /// is given. The cancelled action reports `stop` itself.
    async fn cancel(&self, request: &Request) {
        let cancelled = match request.target.as_deref() {
            Some(target) => match self.in_flight.get(target).map(|t| t.value().clone()) {
                Some(token) => {
                    token.cancel();
                    vec![target.to_string()]
                }
                None => {
                    let err = DaemonError::Validation(format!("no in-flight action '{}'", target));
                    self.reject(Some(&request.action_id), &err).await;
                    return;
                }
            },
            None => self
                .in_flight
                .iter()
                .map(|entry| {
                    entry.value().cancel();
                    entry.key().clone()
                })
                .collect(),
        };

        debug!(count = cancelled.len(), "cancel requested");
        let event = Event::result(&request.action_id, format!("cancelled {}", cancelled.len()))
            .with_tier("N/A")
            .with_data(json!({ "cancelled": cancelled }));
        let _ = self.tx.send(event).await;
    }

    /// Resolve the request's session, pinning it for the action's lifetime.
    fn begin_session(&mut self, request: &Request) -> Result<SessionSnapshot, DaemonError> {
        if let Some(id) = &request.session_id {
            return self.state.sessions.begin(id);
        }
        if let Some(id) = &self.default_session {
            match self.state.sessions.begin(id) {
                Ok(session) => return Ok(session),
                Err(_) => debug!(session_id = %id, "default session expired, creating a new one"),
            }
        }
        let session = self.state.sessions.create(Default::default())?;
        self.default_session = Some(session.id.clone());
        self.state.sessions.begin(&session.id)
    }

    async fn spawn_action(&mut self, request: Request, tasks: &mut JoinSet<()>) {
        let session = match self.begin_session(&request) {
            Ok(session) => session,
            Err(e) => {
                self.reject(Some(&request.action_id), &e).await;
                return;
            }
        };

        let action_token = self.token.child_token();
        self.in_flight
            .insert(request.action_id.clone(), action_token.clone());

        let sink = EventSink::new(
            self.tx.clone(),
            request.action_id.clone(),
            Some(session.id.clone()),
            action_token,
        );
        let state = self.state.clone();
        let in_flight = self.in_flight.clone();

        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(state.pipeline.run(&request, Some(&session), &sink))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DaemonError::Internal("action panicked".to_string())));

            let action_id = request.action_id.as_str();
            let event = match outcome {
                Ok(completion) => {
                    let exchange = Exchange::new(
                        request.command.as_str(),
                        request.input.clone(),
                        completion.text.clone(),
                    );
                    state
                        .sessions
                        .finish(&session.id, Some(exchange), Some(completion.tier_code()));
                    completion.into_event(action_id)
                }
                Err(DaemonError::Cancelled) => {
                    state.sessions.finish(&session.id, None, None);
                    debug!(action_id, "action cancelled");
                    Event::stop(action_id)
                }
                Err(e) => {
                    state.sessions.finish(&session.id, None, None);
                    state.metrics.record_error(e.kind());
                    debug!(action_id, error = %e, "action failed");
                    Event::error(Some(action_id), &e)
                }
            };

            // Free the id before the terminal event so a client may reuse it
            in_flight.remove(action_id);
            sink.send(event).await;
        });
    }

    /// Disconnect: stop in-flight actions, wait for them, drop the default session.
    async fn shutdown(&mut self, mut tasks: JoinSet<()>) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
        while tasks.join_next().await.is_some() {}

        if let Some(id) = self.default_session.take() {
            self.state.sessions.close(&id);
        }
    }
}
