// Daemon assembly
//
// Wires config, executor, memory, pipeline, session registry and listeners
// together, then runs until a shutdown signal.

pub mod lifecycle;

pub use lifecycle::DaemonLifecycle;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::inference::{build_executor, Generate};
use crate::memory::{build_store, KnowledgeStore};
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::server::{DaemonServer, ServerState};
use crate::session::SessionRegistry;

/// A fully wired daemon with bound listeners
pub struct Daemon {
    server: DaemonServer,
    sessions: SessionRegistry,
}

impl Daemon {
    /// Build every component from `config`.
    pub async fn build(config: Arc<Config>) -> Result<Self> {
        let executor = build_executor(&config.inference).context("Failed to start inference executor")?;
        let memory = build_store(&config.memory).context("Failed to set up memory store")?;
        Self::with_components(config, executor, memory).await
    }

    /// Build around an existing executor and knowledge store.
    pub async fn with_components(
        config: Arc<Config>,
        executor: Arc<dyn Generate>,
        memory: Arc<dyn KnowledgeStore>,
    ) -> Result<Self> {
        let metrics = Metrics::new()?;
        let pipeline = Arc::new(Pipeline::new(&config, executor, memory, metrics.clone())?);
        let sessions = SessionRegistry::new(&config.sessions);
        let state = Arc::new(ServerState::new(
            config.server.clone(),
            pipeline,
            sessions.clone(),
            metrics,
        ));
        let server = DaemonServer::bind(&config, state).await?;
        Ok(Self { server, sessions })
    }

    pub fn unix_path(&self) -> &Path {
        self.server.unix_path()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.server.tcp_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let reaper = self.sessions.spawn_reaper(shutdown.clone());
        let result = self.server.run(shutdown).await;
        let _ = reaper.await;
        result
    }
}

/// `fazai daemon`: PID file, signal handling, serve, clean up.
pub async fn run_until_signal(config: Arc<Config>) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(config.server.pid_file.as_deref())?;
    let daemon = Daemon::build(config.clone()).await?;
    lifecycle.write_pid()?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        trigger.cancel();
    });

    info!(
        socket = %daemon.unix_path().display(),
        tcp = ?daemon.tcp_addr(),
        "fazai daemon started"
    );
    let result = daemon.run(shutdown).await;

    if let Err(e) = lifecycle.cleanup() {
        warn!(error = %e, "failed to remove PID file");
    }
    info!("fazai daemon stopped");
    result
}
