//! Handle to one supervised execution-engine process.
//!
//! Probes liveness with signal 0, reads the heartbeat artifact the engine
//! writes into its output directory, and requests graceful termination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

/// File name of the heartbeat artifact inside an output directory.
pub const HEARTBEAT_FILE: &str = "heartbeat";

/// Default upper bound on a heartbeat read.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Values above this are treated as milliseconds since the epoch.
const MILLIS_THRESHOLD: f64 = 1e12;

/// Heartbeat artifact location for an output directory.
pub fn heartbeat_path(output_dir: &Path) -> PathBuf {
    output_dir.join(HEARTBEAT_FILE)
}

/// Handle to a running engine process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    heartbeat_path: PathBuf,
    probe_timeout: Duration,
}

impl ProcessHandle {
    /// Create a handle for `pid` whose heartbeat lives at `heartbeat_path`.
    pub const fn new(pid: u32, heartbeat_path: PathBuf) -> Self {
        Self {
            pid,
            heartbeat_path,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Create a handle for a process writing into `output_dir`.
    pub fn for_output_dir(pid: u32, output_dir: &Path) -> Self {
        Self::new(pid, heartbeat_path(output_dir))
    }

    /// Override the heartbeat read timeout.
    #[must_use]
    pub const fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn heartbeat_path(&self) -> &Path {
        &self.heartbeat_path
    }

    /// OS-level liveness probe.
    ///
    /// A permission error does not prove the process is gone, so it counts
    /// as alive.
    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        {
            match send_signal(self.pid, 0) {
                Ok(()) => true,
                Err(e) => e.raw_os_error() == Some(libc::EPERM),
            }
        }
        #[cfg(not(unix))]
        {
            // No cheap probe available; staleness is left to the heartbeat.
            self.pid != 0
        }
    }

    /// Read the last heartbeat timestamp (Unix seconds).
    ///
    /// Missing, unreadable or malformed artifacts, and reads that exceed the
    /// probe timeout, all yield `None`.
    pub async fn read_heartbeat(&self) -> Option<i64> {
        let read = tokio::time::timeout(
            self.probe_timeout,
            tokio::fs::read_to_string(&self.heartbeat_path),
        )
        .await;

        match read {
            Ok(Ok(content)) => {
                let parsed = parse_heartbeat(&content);
                if parsed.is_none() {
                    debug!(pid = self.pid, path = %self.heartbeat_path.display(), "Malformed heartbeat artifact");
                }
                parsed
            }
            Ok(Err(e)) => {
                debug!(pid = self.pid, path = %self.heartbeat_path.display(), error = %e, "Heartbeat unreadable");
                None
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    path = %self.heartbeat_path.display(),
                    timeout_ms = self.probe_timeout.as_millis(),
                    "Heartbeat read timed out"
                );
                None
            }
        }
    }

    /// Ask the process to stop (SIGTERM). Does not wait for it to exit.
    ///
    /// A process that is already gone is not an error.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            match send_signal(self.pid, libc::SIGTERM) {
                Ok(()) => {
                    debug!(pid = self.pid, "Sent SIGTERM");
                    Ok(())
                }
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
                Err(e) => Err(ProcessError::SignalFailed {
                    pid: self.pid,
                    reason: e.to_string(),
                }),
            }
        }
        #[cfg(not(unix))]
        {
            Err(ProcessError::SignalFailed {
                pid: self.pid,
                reason: "signals are not supported on this platform".to_string(),
            })
        }
    }
}

/// Send `signal` to `pid`. PIDs that would address a process group are
/// rejected as nonexistent.
#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> std::io::Result<()> {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(std::io::Error::from_raw_os_error(libc::ESRCH)),
    };
    // SAFETY: kill(2) only inspects its integer arguments; raw is a positive
    // PID so it never targets a process group.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Parse a heartbeat artifact: a bare number, or a JSON object with a
/// numeric (or numeric string) `timestamp` or `ts` field. Seconds or
/// milliseconds since the epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_heartbeat(content: &str) -> Option<i64> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value = match trimmed.parse::<f64>() {
        Ok(n) => n,
        Err(_) => {
            let json: serde_json::Value = serde_json::from_str(trimmed).ok()?;
            let field = json.get("timestamp").or_else(|| json.get("ts"))?;
            field
                .as_f64()
                .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))?
        }
    };

    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let secs = if value > MILLIS_THRESHOLD {
        value / 1000.0
    } else {
        value
    };
    Some(secs as i64)
}

/// Errors from process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn engine process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}
