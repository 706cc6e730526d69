//! Supervised execution-engine processes.

pub mod handle;
pub mod launcher;

pub use handle::{HEARTBEAT_FILE, ProcessError, ProcessHandle, heartbeat_path, parse_heartbeat};
pub use launcher::{CommandLauncher, LaunchRequest, Launcher};
