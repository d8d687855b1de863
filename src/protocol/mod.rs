// Wire protocol
//
// Newline-delimited JSON requests in, typed events out.

mod event;
mod request;

pub use event::{Event, EventType};
pub use request::{parse_line, Action, Command, Control, RawRequest, Rejection, Request};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound handle given to one in-flight action.
///
/// Sending fails once the connection's writer is gone; the action's token is
/// then cancelled so the pipeline stops and releases its resources.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    action_id: String,
    session_id: Option<String>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(
        tx: mpsc::Sender<Event>,
        action_id: impl Into<String>,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            action_id: action_id.into(),
            session_id,
            cancel,
        }
    }

    /// Sink backed by a fresh channel, for callers outside a connection
    pub fn channel(action_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self::new(tx, action_id, None, CancellationToken::new()),
            rx,
        )
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stream a partial chunk for this action.
    pub async fn partial(&self, text: impl Into<String>) -> bool {
        self.send(Event::partial(&self.action_id, text)).await
    }

    /// Send any event, stamping the session id when the event has none.
    pub async fn send(&self, mut event: Event) -> bool {
        if event.session_id.is_none() {
            event.session_id = self.session_id.clone();
        }
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }
}
