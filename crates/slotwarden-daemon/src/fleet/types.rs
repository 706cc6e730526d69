//! Fleet types: instances, roles, snapshots and errors.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::process::ProcessError;
use crate::slots::SlotPoolError;
use crate::storage::DatabaseError;

/// Lifecycle of one mode's fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    Uninitialized,
    Sizing,
    Running,
    /// Running with at least one dead or held instance, or no Leader.
    Degraded,
}

impl FleetState {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Sizing | Self::Running | Self::Degraded)
    }
}

/// Role of an instance inside its fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the shared output channel.
    Leader,
    /// Only submits orders.
    Worker,
}

/// Cached health, refreshed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Stale,
    Dead,
}

/// One supervised process and the slot it holds.
#[derive(Debug, Clone)]
pub struct FleetInstance {
    /// Stable position inside the fleet.
    pub ordinal: u32,
    /// `None` until a launch for this ordinal has leased a slot.
    pub slot_id: Option<i64>,
    pub role: Role,
    pub pid: Option<u32>,
    pub output_path: PathBuf,
    pub health: Health,
    pub lease_token: String,
    /// Start times of recent restarts, oldest first.
    pub restarts: VecDeque<Instant>,
    /// Restart ceiling exceeded; waiting for an operator.
    pub held: bool,
    /// A replacement is being launched outside the fleet lock.
    pub relaunching: bool,
    /// When the current lease was taken or adopted.
    pub leased_at: Instant,
}

impl FleetInstance {
    /// Stand-in for an ordinal whose launch failed. Dead, so the next sweep
    /// launches it again.
    pub fn unlaunched(ordinal: u32, output_path: PathBuf) -> Self {
        Self {
            ordinal,
            slot_id: None,
            role: Role::Worker,
            pid: None,
            output_path,
            health: Health::Dead,
            lease_token: String::new(),
            restarts: VecDeque::new(),
            held: false,
            relaunching: false,
            leased_at: Instant::now(),
        }
    }

    pub const fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader)
    }

    /// A Worker that may receive order flow.
    pub const fn is_available_worker(&self) -> bool {
        matches!(self.role, Role::Worker) && matches!(self.health, Health::Healthy) && !self.held
    }

    /// Drop restart timestamps that fell out of the window.
    pub fn prune_restarts(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The `owner_ref` stored on a lease held by fleet instance `ordinal`.
pub fn owner_ref(mode: &str, ordinal: u32) -> String {
    format!("{mode}#{ordinal}")
}

/// Inverse of [`owner_ref`]; `None` for owners outside `mode`.
pub fn parse_owner_ref(mode: &str, owner: &str) -> Option<u32> {
    let (prefix, ordinal) = owner.rsplit_once('#')?;
    if prefix != mode {
        return None;
    }
    ordinal.parse().ok()
}

/// Point-in-time view of a fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub mode: String,
    pub state: FleetState,
    pub target_size: u32,
    pub leader_slot: Option<i64>,
    pub leader_output: Option<PathBuf>,
    pub instances: Vec<InstanceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub ordinal: u32,
    pub slot_id: Option<i64>,
    pub role: Role,
    pub health: Health,
    pub pid: Option<u32>,
    pub output_path: PathBuf,
    pub restart_count: usize,
    pub held: bool,
}

impl From<&FleetInstance> for InstanceSnapshot {
    fn from(instance: &FleetInstance) -> Self {
        Self {
            ordinal: instance.ordinal,
            slot_id: instance.slot_id,
            role: instance.role,
            health: instance.health,
            pid: instance.pid,
            output_path: instance.output_path.clone(),
            restart_count: instance.restarts.len(),
            held: instance.held,
        }
    }
}

/// What one sweep changed in a fleet.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeSweep {
    pub mode: String,
    pub reclaimed: usize,
    /// Slot of the newly promoted Leader, if a promotion happened.
    pub promoted: Option<i64>,
    /// Slots leased by replacement processes.
    pub restarted: Vec<i64>,
    pub failures: Vec<String>,
}

/// Errors from fleet operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Mode {mode} is not configured")]
    UnknownMode { mode: String },

    #[error("Fleet for mode {mode} is already running")]
    AlreadyRunning { mode: String },

    #[error("Fleet for mode {mode} is not running")]
    NotRunning { mode: String },

    #[error("No healthy worker available in mode {mode}")]
    NoHealthyWorker { mode: String },

    #[error("Instance {ordinal} exceeded {ceiling} restarts within {window_secs}s and is held")]
    RestartCeilingExceeded {
        ordinal: u32,
        ceiling: u32,
        window_secs: u64,
    },

    #[error("Instance {ordinal} of mode {mode} is already being restarted")]
    RestartInProgress { mode: String, ordinal: u32 },

    #[error("Mode {mode} has no instance on slot {slot_id}")]
    InstanceNotFound { mode: String, slot_id: i64 },

    #[error("Slot {slot_id} is not the leader")]
    NotLeader { slot_id: i64 },

    #[error("Invalid or expired confirmation token")]
    InvalidConfirmation,

    #[error("Order submission failed: {reason}")]
    SubmissionFailed { reason: String },

    #[error("Output link error: {0}")]
    Output(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] SlotPoolError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl FleetError {
    /// HTTP-style status for the API layer.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::AlreadyRunning { .. }
            | Self::NoHealthyWorker { .. }
            | Self::NotLeader { .. }
            | Self::RestartInProgress { .. }
            | Self::Pool(SlotPoolError::PoolExhausted { .. } | SlotPoolError::DuplicateOwner { .. }) => 409,
            Self::UnknownMode { .. }
            | Self::NotRunning { .. }
            | Self::InstanceNotFound { .. }
            | Self::Pool(SlotPoolError::UnknownMode { .. }) => 404,
            Self::InvalidConfirmation => 403,
            Self::RestartCeilingExceeded { .. } => 423,
            _ => 500,
        }
    }
}
