//! Execution-engine launch boundary.
//!
//! The supervisor only needs a PID back from a launch. [`CommandLauncher`]
//! runs the configured engine binary; tests and embedders can supply their
//! own [`Launcher`].

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::handle::ProcessError;

/// Everything an engine process needs to know about its slot.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub mode: String,
    pub slot_id: i64,
    /// Directory the process writes its output and heartbeat into.
    pub output_path: PathBuf,
    pub heartbeat_path: PathBuf,
}

/// Spawns one engine process per slot.
pub trait Launcher: Send + Sync {
    /// Start a process for `request` and return its OS PID.
    fn spawn(&self, request: &LaunchRequest) -> Result<u32, ProcessError>;
}

/// Launches the engine binary as a child process.
///
/// Slot details are passed both as arguments (`--mode`, `--slot-id`,
/// `--output-dir`, `--heartbeat-file`, after any configured arguments) and
/// as `SLOTWARDEN_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&request.output_path)
            .args(&self.args)
            .arg("--mode")
            .arg(&request.mode)
            .arg("--slot-id")
            .arg(request.slot_id.to_string())
            .arg("--output-dir")
            .arg(&request.output_path)
            .arg("--heartbeat-file")
            .arg(&request.heartbeat_path)
            .env("SLOTWARDEN_MODE", &request.mode)
            .env("SLOTWARDEN_SLOT_ID", request.slot_id.to_string())
            .env("SLOTWARDEN_OUTPUT_DIR", &request.output_path)
            .env("SLOTWARDEN_HEARTBEAT_FILE", &request.heartbeat_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Launcher for CommandLauncher {
    fn spawn(&self, request: &LaunchRequest) -> Result<u32, ProcessError> {
        info!(
            mode = %request.mode,
            slot_id = request.slot_id,
            output_dir = %request.output_path.display(),
            program = %self.program.display(),
            "Spawning engine process"
        );

        let mut child = self
            .command(request)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed {
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            reason: "process exited before its PID was read".to_string(),
        })?;

        let slot_id = request.slot_id;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(slot_id, pid, "stdout: {}", line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(slot_id, pid, "stderr: {}", line);
                }
            });
        }

        // Reap the child so an exited engine does not linger as a zombie,
        // which would still answer the signal-0 liveness probe.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(slot_id, pid, ?status, "Engine process exited"),
                Err(e) => warn!(slot_id, pid, error = %e, "Failed to wait for engine process"),
            }
        });

        Ok(pid)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::ProcessHandle;

    fn request(dir: &std::path::Path) -> LaunchRequest {
        LaunchRequest {
            mode: "paper".to_string(),
            slot_id: 7,
            output_path: dir.to_path_buf(),
            heartbeat_path: dir.join("heartbeat"),
        }
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("/nonexistent/engine-binary");
        let err = launcher.spawn(&request(dir.path())).unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_receives_slot_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("sh")
            .with_args(["-c", "echo \"$SLOTWARDEN_SLOT_ID\" > \"$SLOTWARDEN_HEARTBEAT_FILE\""]);
        launcher.spawn(&request(dir.path())).unwrap();

        let heartbeat = dir.path().join("heartbeat");
        for _ in 0..50 {
            if let Ok(content) = std::fs::read_to_string(&heartbeat) {
                if content.trim() == "7" {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("engine did not write its slot id");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_engine_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("sh").with_args(["-c", "exit 0"]);
        let pid = launcher.spawn(&request(dir.path())).unwrap();
        let handle = ProcessHandle::new(pid, dir.path().join("heartbeat"));

        for _ in 0..50 {
            if !handle.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("exited engine still looks alive");
    }
}
