// Daemon lifecycle management
//
// PID file creation/removal, process existence checks and the
// SIGTERM-then-SIGKILL stop sequence used by `fazai stop`.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::user_dir;

/// Grace period between SIGTERM and SIGKILL
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Manages the daemon PID file
pub struct DaemonLifecycle {
    pid_file: PathBuf,
}

impl DaemonLifecycle {
    /// Use `pid_file`, or `~/.fazai/fazai.pid` when none is configured.
    pub fn new(pid_file: Option<&Path>) -> Result<Self> {
        let pid_file = match pid_file {
            Some(path) => path.to_path_buf(),
            None => user_dir()
                .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?
                .join("fazai.pid"),
        };

        if let Some(parent) = pid_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        Ok(Self { pid_file })
    }

    /// Write the current PID. Refuses if another live daemon owns the file.
    pub fn write_pid(&self) -> Result<()> {
        if let Ok(pid) = self.read_pid() {
            if pid != std::process::id() && process_exists(pid) {
                anyhow::bail!("Daemon already running with PID {}", pid);
            }
        }
        let pid = std::process::id();
        fs::write(&self.pid_file, pid.to_string())
            .with_context(|| format!("Failed to write PID file: {}", self.pid_file.display()))?;
        info!(pid = pid, path = %self.pid_file.display(), "PID file written");
        Ok(())
    }

    /// Remove the PID file (called on shutdown)
    pub fn cleanup(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).with_context(|| {
                format!("Failed to remove PID file: {}", self.pid_file.display())
            })?;
            info!("PID file removed");
        }
        Ok(())
    }

    /// PID file exists, parses, and names a live process
    pub fn is_running(&self) -> bool {
        self.read_pid().map(process_exists).unwrap_or(false)
    }

    pub fn read_pid(&self) -> Result<u32> {
        let pid_str = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("Failed to read PID file: {}", self.pid_file.display()))?;
        let pid: u32 = pid_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid PID in file: {}", pid_str))?;
        if to_pid(pid).is_none() {
            anyhow::bail!("PID out of range in file: {}", pid);
        }
        Ok(pid)
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Stop the daemon: SIGTERM, wait up to 5 seconds, then SIGKILL.
    ///
    /// Ok if the daemon stopped or was not running; a stale PID file is removed.
    pub fn stop_daemon(&self) -> Result<()> {
        if !self.pid_file.exists() {
            info!("Daemon not running (no PID file)");
            return Ok(());
        }

        let pid = match self.read_pid() {
            Ok(p) => p,
            Err(e) => {
                warn!("Unreadable PID file: {}. Removing...", e);
                self.cleanup()?;
                return Ok(());
            }
        };

        if !process_exists(pid) {
            info!(pid = pid, "Daemon not running, removing stale PID file");
            self.cleanup()?;
            return Ok(());
        }

        let target = to_pid(pid).ok_or_else(|| anyhow::anyhow!("PID out of range: {}", pid))?;
        info!(pid = pid, "Stopping daemon with SIGTERM...");
        kill(target, Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon")?;

        let start = Instant::now();
        while start.elapsed() < STOP_TIMEOUT {
            if !process_exists(pid) {
                info!(pid = pid, "Daemon stopped gracefully");
                // The daemon removes its own PID file; this covers a crash on the way out
                self.cleanup()?;
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        warn!(pid = pid, "Daemon did not stop gracefully, sending SIGKILL...");
        kill(target, Signal::SIGKILL)
            .context("Failed to send SIGKILL to daemon")?;
        std::thread::sleep(Duration::from_millis(500));

        if process_exists(pid) {
            anyhow::bail!("Failed to stop daemon (process {} still running)", pid);
        }

        info!(pid = pid, "Daemon force-stopped with SIGKILL");
        self.cleanup()?;
        Ok(())
    }
}

/// Only positive values name a single process; 0 and negatives address groups.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|&p| p > 0).map(Pid::from_raw)
}

/// kill(pid, 0) checks existence without sending a signal
fn process_exists(pid: u32) -> bool {
    to_pid(pid).map(|p| kill(p, None).is_ok()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("run").join("fazai.pid");

        let lifecycle = DaemonLifecycle::new(Some(&pid_file)).unwrap();

        lifecycle.write_pid().unwrap();
        assert!(pid_file.exists());
        assert_eq!(lifecycle.read_pid().unwrap(), std::process::id());
        assert!(lifecycle.is_running());

        lifecycle.cleanup().unwrap();
        assert!(!pid_file.exists());
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn test_stop_removes_stale_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("fazai.pid");
        fs::write(&pid_file, "999999999").unwrap();

        let lifecycle = DaemonLifecycle::new(Some(&pid_file)).unwrap();
        assert!(!lifecycle.is_running());
        lifecycle.stop_daemon().unwrap();
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(999999999));
        assert!(!process_exists(0));
        assert!(!process_exists(u32::MAX));
    }

    #[test]
    fn test_out_of_range_pid_is_rejected_without_signalling() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("fazai.pid");
        let lifecycle = DaemonLifecycle::new(Some(&pid_file)).unwrap();

        for raw in ["0", "4294967295", "2147483648"] {
            fs::write(&pid_file, raw).unwrap();
            assert!(lifecycle.read_pid().is_err());
            assert!(!lifecycle.is_running());
            lifecycle.stop_daemon().unwrap();
            assert!(!pid_file.exists());
        }
    }
}
