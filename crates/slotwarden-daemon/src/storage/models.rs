//! Database models for the slot pool.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Slot record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlotRecord {
    pub slot_id: i64,
    pub status: String,
    pub owner_ref: Option<String>,
    pub process_id: Option<i64>,
    pub output_path: Option<String>,
    pub lease_token: Option<String>,
    pub leased_at: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub released_at: Option<i64>,
    pub release_reason: Option<String>,
}

impl SlotRecord {
    /// Parsed status. Unknown strings are reported as `Failed` so they are
    /// eligible for re-lease rather than silently leaked.
    pub fn slot_status(&self) -> SlotStatus {
        self.status.parse().unwrap_or(SlotStatus::Failed)
    }

    pub fn is_leased(&self) -> bool {
        self.slot_status() == SlotStatus::Leased
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output_path.as_deref().map(PathBuf::from)
    }

    /// OS process id, if one is attached and fits a `u32`.
    pub fn pid(&self) -> Option<u32> {
        self.process_id.and_then(|p| u32::try_from(p).ok())
    }
}

/// Range of slot identifiers owned by one mode.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlotRange {
    pub mode: String,
    pub base: i64,
    pub size: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SlotRange {
    /// Last slot identifier of the range (inclusive).
    pub const fn last_slot(&self) -> i64 {
        self.base + self.size - 1
    }

    pub const fn contains(&self, slot_id: i64) -> bool {
        slot_id >= self.base && slot_id <= self.last_slot()
    }
}

/// Leader promotion audit record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaderEvent {
    pub id: i64,
    pub mode: String,
    pub old_slot_id: Option<i64>,
    pub new_slot_id: i64,
    pub reason: String,
    pub created_at: i64,
}

/// Slot status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Free,
    Leased,
    Failed,
}

impl SlotStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Leased => "leased",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "leased" => Ok(Self::Leased),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown slot status: {other}")),
        }
    }
}

/// Why a lease ended. Stored in `release_reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Holder finished normally.
    Completed,
    /// Supervisor is shutting the fleet down.
    Shutdown,
    /// Instance is being relaunched.
    Restart,
    /// Operator reset of the whole fleet.
    Reset,
    /// The process could not be launched after leasing.
    SpawnFailed,
    /// Leader could not write its output.
    OutputFailure,
    /// Lease left over by a previous supervisor run.
    Orphaned,
    /// OS process no longer exists.
    ProcessExited,
    /// Process alive but heartbeat too old.
    HeartbeatStale,
    /// No process attached within the lease TTL.
    LeaseExpired,
}

impl ReleaseReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
            Self::Reset => "reset",
            Self::SpawnFailed => "spawn_failed",
            Self::OutputFailure => "output_failure",
            Self::Orphaned => "orphaned",
            Self::ProcessExited => "process_exited",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::LeaseExpired => "lease_expired",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
