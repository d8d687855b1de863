// Daemon transport
//
// Unix-domain socket and TCP listeners speaking the same NDJSON protocol.
// Each accepted stream is handed to `connection::serve_connection`; a
// semaphore caps live connections, and clients past the cap get one
// Backpressure error before the stream is closed.

mod connection;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerConfig};
use crate::errors::DaemonError;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::protocol::Event;
use crate::session::SessionRegistry;

/// How long shutdown waits for open connections to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared by every connection
pub struct ServerState {
    pub config: ServerConfig,
    pub pipeline: Arc<Pipeline>,
    pub sessions: SessionRegistry,
    pub metrics: Metrics,
    started: Instant,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        pipeline: Arc<Pipeline>,
        sessions: SessionRegistry,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            pipeline,
            sessions,
            metrics,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Daemon-wide status document
    pub fn status(&self, include_prometheus: bool) -> Value {
        let mut status = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
            "uptime_secs": self.uptime().as_secs(),
            "sessions": self.sessions.len(),
            "connections": self.metrics.live_connections(),
            "pipeline": self.pipeline.describe(),
            "metrics": self.metrics.summary(),
        });
        if include_prometheus {
            status["prometheus"] = Value::String(self.metrics.render_text());
        }
        status
    }
}

/// Bound listeners, ready to serve
pub struct DaemonServer {
    state: Arc<ServerState>,
    unix: UnixListener,
    unix_path: PathBuf,
    tcp: Option<TcpListener>,
    limiter: Arc<Semaphore>,
}

impl DaemonServer {
    /// Bind the Unix socket (replacing a stale file) and, if configured, TCP.
    pub async fn bind(config: &Config, state: Arc<ServerState>) -> Result<Self> {
        let unix_path = config.server.unix_socket.clone();
        if let Some(parent) = unix_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
        }
        remove_stale_socket(&unix_path)?;

        let unix = UnixListener::bind(&unix_path)
            .with_context(|| format!("Failed to bind Unix socket: {}", unix_path.display()))?;
        set_socket_permissions(&unix_path);
        info!(path = %unix_path.display(), "listening on Unix socket");

        let tcp = match config.server.tcp_addr()? {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind TCP address: {}", addr))?;
                info!(addr = %listener.local_addr()?, "listening on TCP");
                Some(listener)
            }
            None => None,
        };

        let limiter = Arc::new(Semaphore::new(config.server.max_connections.max(1)));
        Ok(Self {
            state,
            unix,
            unix_path,
            tcp,
            limiter,
        })
    }

    pub fn unix_path(&self) -> &Path {
        &self.unix_path
    }

    /// Actual TCP address (useful when bound to port 0)
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Accept connections until `shutdown` fires, then drain and remove the socket.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.unix.accept() => match accepted {
                    Ok((stream, _)) => self.admit(stream, "unix".to_string(), &tracker, &shutdown),
                    Err(e) => warn!(error = %e, "Unix accept failed"),
                },
                accepted = accept_tcp(self.tcp.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        self.admit(stream, peer.to_string(), &tracker, &shutdown)
                    }
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
            }
        }

        info!("shutting down listeners");
        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(timeout = ?DRAIN_TIMEOUT, "connections still open after drain timeout");
        }
        if let Err(e) = std::fs::remove_file(&self.unix_path) {
            debug!(error = %e, "socket file already gone");
        }
        Ok(())
    }

    fn admit<S>(&self, stream: S, peer: String, tracker: &TaskTracker, shutdown: &CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let state = self.state.clone();
        let permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "connection limit reached, refusing client");
                state.metrics.record_error("Backpressure");
                tracker.spawn(refuse(stream));
                return;
            }
        };

        let token = shutdown.child_token();
        tracker.spawn(async move {
            state.metrics.connection_opened();
            debug!(peer = %peer, "client connected");
            connection::serve_connection(stream, state.clone(), token).await;
            state.metrics.connection_closed();
            debug!(peer = %peer, "client disconnected");
            drop(permit);
        });
    }
}

async fn accept_tcp(
    listener: Option<&TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// One Backpressure error line, then close
async fn refuse<S>(mut stream: S)
where
    S: AsyncWrite + Unpin,
{
    let err = DaemonError::Backpressure("too many connections".to_string());
    let line = format!("{}\n", Event::error(None, &err).to_line());
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            anyhow::bail!("Another daemon is already listening on {}", path.display());
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }
    Ok(())
}

fn set_socket_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
        warn!(error = %e, path = %path.display(), "could not set socket permissions");
    }
}
