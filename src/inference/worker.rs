// Supervised inference worker
//
// One long-lived worker process per loaded model, fed through a bounded job
// queue so the engine only ever sees one generation at a time. Wire format on
// the worker's stdio, one JSON line each way:
//
//   -> {"prompt": "...", "params": {...}}
//   <- {"text": "..."}  |  {"error": "..."}  |  plain text
//
// A job whose caller gave up (deadline, cancel, dropped connection) kills the
// worker; the next job starts a fresh one, within the restart budget.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Generate, GenerationParams};
use crate::config::InferenceConfig;
use crate::errors::InferenceError;

const KILL_GRACE: Duration = Duration::from_secs(2);

struct Job {
    prompt: String,
    params: GenerationParams,
    reply: oneshot::Sender<Result<String, InferenceError>>,
    cancel: CancellationToken,
}

/// Handle to the worker supervisor task
pub struct WorkerExecutor {
    jobs: mpsc::Sender<Job>,
    name: String,
}

impl WorkerExecutor {
    /// Start the supervisor. The worker process itself is spawned lazily on
    /// the first job. Must be called inside a tokio runtime.
    pub fn spawn(config: &InferenceConfig) -> Result<Self> {
        let argv = config.worker_command.clone();
        if argv.is_empty() {
            bail!("inference.worker_command is empty");
        }
        let name = argv[0].clone();

        let (jobs, rx) = mpsc::channel(config.queue_depth.max(1));
        let supervisor = Supervisor {
            argv,
            process: None,
            spawned_once: false,
            restarts: VecDeque::new(),
            max_restarts: config.max_restarts as usize,
            restart_window: Duration::from_secs(config.restart_window_secs),
        };
        tokio::spawn(supervisor.run(rx));

        Ok(Self { jobs, name })
    }
}

#[async_trait]
impl Generate for WorkerExecutor {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, InferenceError> {
        let cancel = CancellationToken::new();
        // Dropping this future (deadline, cancel) cancels the job
        let guard = cancel.clone().drop_guard();
        let (reply, reply_rx) = oneshot::channel();

        self.jobs
            .send(Job {
                prompt: prompt.to_string(),
                params: params.clone(),
                reply,
                cancel,
            })
            .await
            .map_err(|_| InferenceError::ProcessFailure("worker supervisor stopped".into()))?;

        let result = reply_rx
            .await
            .map_err(|_| InferenceError::ProcessFailure("worker dropped the job".into()))?;
        guard.disarm();
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    async fn round_trip(&mut self, line: &str) -> Result<String, String> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write to worker failed: {}", e))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| format!("write to worker failed: {}", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("write to worker failed: {}", e))?;

        loop {
            match self.stdout.next_line().await {
                Ok(Some(reply)) if reply.trim().is_empty() => continue,
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => return Err("worker exited before replying".to_string()),
                Err(e) => return Err(format!("read from worker failed: {}", e)),
            }
        }
    }
}

struct Supervisor {
    argv: Vec<String>,
    process: Option<WorkerProcess>,
    spawned_once: bool,
    restarts: VecDeque<Instant>,
    max_restarts: usize,
    restart_window: Duration,
}

impl Supervisor {
    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            if job.cancel.is_cancelled() {
                continue;
            }
            let result = self.execute(&job).await;
            let _ = job.reply.send(result);
        }
        self.kill().await;
        debug!(worker = %self.argv[0], "inference supervisor stopped");
    }

    async fn execute(&mut self, job: &Job) -> Result<String, InferenceError> {
        self.ensure_running()?;
        let Some(process) = self.process.as_mut() else {
            return Err(InferenceError::ProcessFailure("worker not running".into()));
        };

        let line = json!({ "prompt": job.prompt, "params": job.params }).to_string();
        let outcome = tokio::select! {
            _ = job.cancel.cancelled() => None,
            res = process.round_trip(&line) => Some(res),
        };

        match outcome {
            Some(Ok(reply)) => parse_reply(&reply),
            Some(Err(e)) => {
                warn!(worker = %self.argv[0], error = %e, "inference worker failed");
                self.kill().await;
                Err(InferenceError::ProcessFailure(e))
            }
            None => {
                info!(worker = %self.argv[0], "job abandoned by caller, killing worker");
                self.kill().await;
                Err(InferenceError::ProcessFailure("job cancelled".into()))
            }
        }
    }

    fn ensure_running(&mut self) -> Result<(), InferenceError> {
        if let Some(process) = self.process.as_mut() {
            match process.child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!(worker = %self.argv[0], %status, "inference worker exited");
                }
                Err(e) => warn!(worker = %self.argv[0], error = %e, "cannot poll worker"),
            }
            self.process = None;
        }

        if self.spawned_once {
            let now = Instant::now();
            while let Some(oldest) = self.restarts.front() {
                if now.duration_since(*oldest) > self.restart_window {
                    self.restarts.pop_front();
                } else {
                    break;
                }
            }
            if self.restarts.len() >= self.max_restarts {
                return Err(InferenceError::ProcessFailure(format!(
                    "worker restarted {} times within {:?}, giving up",
                    self.restarts.len(),
                    self.restart_window
                )));
            }
            self.restarts.push_back(now);
        }

        self.process = Some(self.spawn_process()?);
        self.spawned_once = true;
        Ok(())
    }

    fn spawn_process(&self) -> Result<WorkerProcess, InferenceError> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InferenceError::ProcessFailure(format!("failed to spawn {}: {}", self.argv[0], e))
            })?;

        let missing = |what: &str| InferenceError::ProcessFailure(format!("worker {} not piped", what));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        // Drain stderr into the log so a chatty engine never blocks on a full pipe
        let worker = self.argv[0].clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(worker = %worker, "{}", line);
            }
        });

        info!(worker = %self.argv[0], pid = ?child.id(), "inference worker started");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, process.child.wait()).await;
        }
    }
}

fn parse_reply(line: &str) -> Result<String, InferenceError> {
    let text = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(obj)) => {
            if let Some(err) = obj.get("error").and_then(Value::as_str) {
                return Err(InferenceError::ProcessFailure(err.to_string()));
            }
            match obj.get("text").or_else(|| obj.get("result")) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => line.to_string(),
            }
        }
        Ok(Value::String(s)) => s,
        _ => line.to_string(),
    };
    if text.trim().is_empty() {
        return Err(InferenceError::EmptyOutput);
    }
    Ok(text)
}
