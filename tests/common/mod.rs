// Shared harness for the daemon integration tests: a daemon bound to a
// temporary socket and an ephemeral TCP port, a canned local model and a
// line-oriented test client.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use fazai::config::Config;
use fazai::daemon::Daemon;
use fazai::errors::InferenceError;
use fazai::inference::{GenerationParams, Generate};
use fazai::memory::{InMemoryStore, KnowledgeStore};
use fazai::protocol::Event;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Local model stand-in: always the same reply, optionally after a delay
pub struct CannedModel {
    reply: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl CannedModel {
    pub fn reply(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: text.to_string(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    /// Answers only after an hour; used to keep an action in flight
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            reply: "too late".to_string(),
            delay: Duration::from_secs(3600),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generate for CannedModel {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }

    fn name(&self) -> &str {
        "canned"
    }
}

/// A running daemon
pub struct TestDaemon {
    pub socket: PathBuf,
    pub tcp: Option<SocketAddr>,
    pub memory: Arc<InMemoryStore>,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

/// Default config listening on an ephemeral TCP port
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.tcp_bind = "127.0.0.1:0".to_string();
    config
}

impl TestDaemon {
    pub async fn start(config: Config, model: Arc<dyn Generate>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = config;
        config.server.unix_socket = dir.path().join("fazai.sock");

        let memory = Arc::new(InMemoryStore::default());
        let store: Arc<dyn KnowledgeStore> = memory.clone();
        let daemon = Daemon::with_components(Arc::new(config), model, store)
            .await
            .unwrap();

        let socket = daemon.unix_path().to_path_buf();
        let tcp = daemon.tcp_addr();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));

        Self {
            socket,
            tcp,
            memory,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> TestClient<UnixStream> {
        TestClient::new(UnixStream::connect(&self.socket).await.unwrap())
    }

    pub async fn connect_tcp(&self) -> TestClient<TcpStream> {
        let addr = self.tcp.expect("tcp listener");
        TestClient::new(TcpStream::connect(addr).await.unwrap())
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

/// Raw NDJSON client
pub struct TestClient<S> {
    framed: Framed<S, LinesCodec>,
}

impl<S> TestClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.framed.send(line.to_string()).await.unwrap();
    }

    pub async fn send(&mut self, request: serde_json::Value) {
        self.send_line(&request.to_string()).await;
    }

    /// Next event, or None once the daemon closed the connection
    pub async fn next_event(&mut self) -> Option<Event> {
        let line = tokio::time::timeout(READ_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for an event")?;
        let line = line.ok()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Every event of `action_id` up to and including its terminal one.
    /// Events of other actions are discarded.
    pub async fn events_for(&mut self, action_id: &str) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            if event.action_id.as_deref() != Some(action_id) {
                continue;
            }
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
        panic!("connection closed before {} finished", action_id);
    }

    /// Terminal event of `action_id`
    pub async fn terminal(&mut self, action_id: &str) -> Event {
        self.events_for(action_id).await.pop().unwrap()
    }
}
