// Session registry
//
// Sole owner of session existence. Callers get cloned snapshots; every
// mutation goes through the registry and runs under the DashMap shard lock
// for that id, so a pipeline reading its session never races a close.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::errors::DaemonError;

/// One (request, response) pair of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub action: String,
    pub request: String,
    pub response: String,
    pub at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(action: &str, request: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            request: request.into(),
            response: response.into(),
            at: Utc::now(),
        }
    }
}

struct Session {
    created_at: DateTime<Utc>,
    last_active: Instant,
    transcript: VecDeque<Exchange>,
    last_tier: Option<String>,
    params: Map<String, Value>,
    in_flight: usize,
}

impl Session {
    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            created_at: self.created_at,
            transcript: self.transcript.iter().cloned().collect(),
            last_tier: self.last_tier.clone(),
            params: self.params.clone(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.in_flight == 0 && self.last_active.elapsed() > idle_timeout
    }
}

/// Read-only copy of a session handed to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub transcript: Vec<Exchange>,
    /// Last tier that produced a result, kept for diagnostics
    pub last_tier: Option<String>,
    /// Parameters supplied at create_session
    pub params: Map<String, Value>,
}

/// Thread-safe registry of live sessions. Clone freely (it's an Arc inside).
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, Session>,
    idle_timeout: Duration,
    reap_interval: Duration,
    transcript_len: usize,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                idle_timeout: config.idle_timeout(),
                reap_interval: config.reap_interval(),
                transcript_len: config.transcript_len.max(1),
                max_sessions: config.max_sessions,
            }),
        }
    }

    /// Allocate and register a new session.
    pub fn create(&self, params: Map<String, Value>) -> Result<SessionSnapshot, DaemonError> {
        if self.inner.sessions.len() >= self.inner.max_sessions {
            // Make room from idle sessions before refusing
            self.reap_expired();
            if self.inner.sessions.len() >= self.inner.max_sessions {
                return Err(DaemonError::Backpressure(format!(
                    "session limit of {} reached",
                    self.inner.max_sessions
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let session = Session {
            created_at: Utc::now(),
            last_active: Instant::now(),
            transcript: VecDeque::with_capacity(self.inner.transcript_len),
            last_tier: None,
            params,
            in_flight: 0,
        };
        let snapshot = session.snapshot(&id);
        self.inner.sessions.insert(id.clone(), session);
        debug!(session_id = %id, "session created");
        Ok(snapshot)
    }

    /// Look up a session; expired sessions are treated as absent.
    pub fn get(&self, id: &str) -> Result<SessionSnapshot, DaemonError> {
        let idle = self.inner.idle_timeout;
        let expired = match self.inner.sessions.get(id) {
            None => return Err(DaemonError::SessionNotFound(id.to_string())),
            Some(session) if session.is_expired(idle) => true,
            Some(session) => return Ok(session.snapshot(id)),
        };
        if expired {
            self.inner.sessions.remove_if(id, |_, s| s.is_expired(idle));
        }
        Err(DaemonError::SessionNotFound(id.to_string()))
    }

    /// Mark a session as active now.
    pub fn touch(&self, id: &str) -> Result<(), DaemonError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| DaemonError::SessionNotFound(id.to_string()))?;
        session.last_active = Instant::now();
        Ok(())
    }

    /// Remove a session. Returns true if it existed.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.inner.sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session closed");
        }
        removed
    }

    /// Start an action on a session: touch it, pin it against the reaper and
    /// return a snapshot for the pipeline.
    pub fn begin(&self, id: &str) -> Result<SessionSnapshot, DaemonError> {
        let idle = self.inner.idle_timeout;
        let mut session = self
            .inner
            .sessions
            .get_mut(id)
            .filter(|s| !s.is_expired(idle))
            .ok_or_else(|| DaemonError::SessionNotFound(id.to_string()))?;
        session.in_flight += 1;
        session.last_active = Instant::now();
        Ok(session.snapshot(id))
    }

    /// Finish an action started with `begin`, appending its exchange to the
    /// bounded transcript. A session closed meanwhile is left closed.
    pub fn finish(&self, id: &str, exchange: Option<Exchange>, tier: Option<&str>) {
        let transcript_len = self.inner.transcript_len;
        if let Some(mut session) = self.inner.sessions.get_mut(id) {
            session.in_flight = session.in_flight.saturating_sub(1);
            session.last_active = Instant::now();
            if let Some(exchange) = exchange {
                while session.transcript.len() >= transcript_len {
                    session.transcript.pop_front();
                }
                session.transcript.push_back(exchange);
            }
            if let Some(tier) = tier {
                session.last_tier = Some(tier.to_string());
            }
        }
    }

    /// Close every session idle past the threshold. Returns how many were closed.
    pub fn reap_expired(&self) -> usize {
        let idle = self.inner.idle_timeout;
        let before = self.inner.sessions.len();
        self.inner.sessions.retain(|_, s| !s.is_expired(idle));
        before.saturating_sub(self.inner.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Run the idle reaper until `shutdown` fires.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_expired();
                        if reaped > 0 {
                            info!(reaped, live = registry.len(), "reaped idle sessions");
                        }
                    }
                }
            }
        })
    }
}
