// Shell execution with live output streaming
//
// Commands run through `sh -c` in the configured working directory. Stdout
// lines are streamed as partial events while the command runs; the caller
// gets the full (bounded) stdout, stderr and exit code at the end. Commands
// never leave the host: there is no remote tier on this path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ShellConfig;
use crate::errors::DaemonError;
use crate::protocol::EventSink;

/// Shell words that resolve without a PATH lookup
const BUILTINS: &[&str] = &[
    ".", ":", "[", "alias", "cd", "command", "echo", "eval", "exec", "exit", "export", "false",
    "for", "if", "kill", "printf", "pwd", "read", "set", "source", "test", "true", "type",
    "ulimit", "umask", "unset", "wait", "while",
];

/// Captured result of one command
#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
    max_output_bytes: usize,
    blocked: Vec<String>,
    working_dir: PathBuf,
}

impl ShellRunner {
    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
            blocked: config
                .blocked_patterns
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect(),
            working_dir: config.working_dir.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Refuse commands containing a blocked fragment.
    pub fn check_allowed(&self, command: &str) -> Result<(), DaemonError> {
        let normalized = normalize(command);
        match self.blocked.iter().find(|p| normalized.contains(p.as_str())) {
            Some(pattern) => Err(DaemonError::Validation(format!(
                "command refused, matches blocked pattern '{}'",
                pattern
            ))),
            None => Ok(()),
        }
    }

    /// Run `command`, streaming stdout lines to `sink`.
    ///
    /// A non-zero exit is a normal result. Missing the deadline kills the
    /// process and yields `Timeout`; `cancel` kills it and yields `Cancelled`.
    pub async fn run(
        &self,
        command: &str,
        sink: Option<&EventSink>,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, DaemonError> {
        self.check_allowed(command)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Internal(format!("failed to spawn shell: {}", e)))?;

        info!(command = %command, pid = ?child.id(), "running shell command");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::Internal("stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DaemonError::Internal("stderr was not piped".into()))?;

        // Drain stderr in a background task so it doesn't block stdout reading
        let limit = self.max_output_bytes;
        let stderr_task = tokio::spawn(async move {
            let mut reader = stderr;
            let mut buf = Vec::new();
            let _ = (&mut reader).take(limit as u64).read_to_end(&mut buf).await;
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        // Drain stdout on this task, streaming each line. A line never reads
        // past the remaining room, so nothing beyond the cap is held or sent.
        let collect = async {
            let mut reader = BufReader::new(stdout);
            let mut kept: Vec<u8> = Vec::new();
            let mut line = Vec::new();
            let mut truncated = false;
            loop {
                let room = limit.saturating_sub(kept.len());
                if room == 0 {
                    if let Ok(rest) = reader.fill_buf().await {
                        truncated = !rest.is_empty();
                    }
                    break;
                }
                line.clear();
                match (&mut reader).take(room as u64).read_until(b'\n', &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if let Some(sink) = sink {
                    sink.partial(String::from_utf8_lossy(&line).into_owned()).await;
                }
                kept.extend_from_slice(&line);
            }
            if truncated {
                debug!(limit, "shell stdout truncated");
            }
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
            let status = child.wait().await;
            (String::from_utf8_lossy(&kept).into_owned(), truncated, status)
        };

        let (stdout_buf, truncated, status) = tokio::select! {
            done = collect => done,
            _ = tokio::time::sleep(self.timeout) => {
                debug!(command = %command, "shell command timed out");
                stderr_task.abort();
                return Err(DaemonError::Timeout(self.timeout));
            }
            _ = cancel.cancelled() => {
                stderr_task.abort();
                return Err(DaemonError::Cancelled);
            }
        };

        let status = status.map_err(|e| DaemonError::Internal(format!("wait failed: {}", e)))?;
        let stderr_buf = stderr_task.await.unwrap_or_default();

        Ok(ShellOutput {
            stdout: stdout_buf,
            stderr: stderr_buf,
            exit_code: status.code().unwrap_or(-1),
            truncated,
        })
    }
}

/// True when `input` already looks like a command: its first word (after any
/// `VAR=value` prefixes) is a shell builtin or an executable on PATH.
pub fn resolves_directly(input: &str) -> bool {
    let Some(word) = input
        .split_whitespace()
        .find(|w| !(w.contains('=') && !w.starts_with('=') && !w.contains('/')))
    else {
        return false;
    };

    if BUILTINS.contains(&word) {
        return true;
    }
    if word.contains('/') {
        return Path::new(word).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(word).is_file()))
        .unwrap_or(false)
}

/// Prompt for the single-pass natural language -> command translation
pub fn translation_prompt(request: &str) -> String {
    format!(
        "Translate the request below into ONE Linux shell command.\n\
         Reply with the command only: no explanation, no markdown.\n\n\
         Request: {}",
        request.trim()
    )
}

/// Pull the command out of a model reply (code fences, `$ ` prompts, prose lines).
pub fn extract_command(reply: &str) -> Option<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .map(|l| l.trim_start_matches("$ ").trim_matches('`').trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
