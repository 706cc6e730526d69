//! Reclaiming leases whose holders died or stopped heartbeating.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::pool::{SlotPool, SlotPoolError};
use crate::process::ProcessHandle;
use crate::storage::{ReleaseReason, SlotRecord, SlotStatus};

/// A lease taken away from its holder during a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ReclaimedLease {
    pub slot_id: i64,
    pub owner_ref: Option<String>,
    pub lease_token: String,
    pub pid: Option<u32>,
    pub reason: ReleaseReason,
}

/// Health of a lease that survived the sweep.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseObservation {
    pub slot_id: i64,
    pub owner_ref: Option<String>,
    pub lease_token: String,
    pub pid: Option<u32>,
    /// Seconds since the last heartbeat (artifact, else stored value).
    pub heartbeat_age_secs: i64,
    /// Whether the artifact itself was readable this sweep.
    pub artifact_read: bool,
}

/// Outcome of one `reap_stale` pass over a mode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub mode: String,
    pub reclaimed: Vec<ReclaimedLease>,
    pub observed: Vec<LeaseObservation>,
}

impl ReapReport {
    /// Number of leases reclaimed.
    pub fn count(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn reclaimed_slot(&self, slot_id: i64) -> Option<&ReclaimedLease> {
        self.reclaimed.iter().find(|r| r.slot_id == slot_id)
    }
}

enum Verdict {
    Keep(LeaseObservation),
    Reclaim(ReleaseReason),
}

fn whole_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

impl SlotPool {
    /// Reclaim leases of `mode` whose holder is dead, stuck, or never
    /// attached a process.
    ///
    /// Reclaimed slots are marked `failed`, which makes them leasable again.
    /// Each reclaim is compare-and-set on the lease token, so a release that
    /// races with the sweep wins cleanly.
    pub async fn reap_stale(
        &self,
        mode: &str,
        now: i64,
        lease_ttl: Duration,
        heartbeat_timeout: Duration,
    ) -> Result<ReapReport, SlotPoolError> {
        let leased = self.leased(mode).await?;
        let mut report = ReapReport {
            mode: mode.to_string(),
            ..ReapReport::default()
        };

        for record in leased {
            let Some(token) = record.lease_token.clone() else {
                continue;
            };

            let verdict = self
                .judge(&record, &token, now, lease_ttl, heartbeat_timeout)
                .await?;

            match verdict {
                Verdict::Keep(observation) => report.observed.push(observation),
                Verdict::Reclaim(reason) => {
                    let ended = self
                        .db()
                        .end_lease(&token, SlotStatus::Failed, reason, now)
                        .await?;
                    if ended {
                        info!(
                            mode,
                            slot_id = record.slot_id,
                            pid = ?record.pid(),
                            reason = %reason,
                            "Reclaimed stale lease"
                        );
                        report.reclaimed.push(ReclaimedLease {
                            slot_id: record.slot_id,
                            owner_ref: record.owner_ref.clone(),
                            lease_token: token,
                            pid: record.pid(),
                            reason,
                        });
                    } else {
                        debug!(mode, slot_id = record.slot_id, "Lease ended before reclaim");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn judge(
        &self,
        record: &SlotRecord,
        token: &str,
        now: i64,
        lease_ttl: Duration,
        heartbeat_timeout: Duration,
    ) -> Result<Verdict, SlotPoolError> {
        let leased_at = record.leased_at.unwrap_or(now);

        let Some(pid) = record.pid() else {
            if now - leased_at > whole_secs(lease_ttl) {
                return Ok(Verdict::Reclaim(ReleaseReason::LeaseExpired));
            }
            return Ok(Verdict::Keep(LeaseObservation {
                slot_id: record.slot_id,
                owner_ref: record.owner_ref.clone(),
                lease_token: token.to_string(),
                pid: None,
                heartbeat_age_secs: now - record.last_heartbeat.unwrap_or(leased_at),
                artifact_read: false,
            }));
        };

        let handle = match record.output_dir() {
            Some(dir) => ProcessHandle::for_output_dir(pid, &dir),
            None => ProcessHandle::new(pid, std::path::PathBuf::new()),
        }
        .with_probe_timeout(self.policy().probe_timeout);

        if !handle.is_alive() {
            return Ok(Verdict::Reclaim(ReleaseReason::ProcessExited));
        }

        let artifact = handle.read_heartbeat().await;
        let last = artifact.or(record.last_heartbeat).unwrap_or(leased_at);
        let age = now - last;

        if age > whole_secs(heartbeat_timeout) {
            if let Err(e) = handle.terminate() {
                warn!(slot_id = record.slot_id, pid, error = %e, "Failed to stop stuck process");
            }
            return Ok(Verdict::Reclaim(ReleaseReason::HeartbeatStale));
        }

        if let Some(ts) = artifact {
            if record.last_heartbeat.is_none_or(|prev| ts > prev) {
                self.db().record_heartbeat(token, ts).await?;
            }
        }

        Ok(Verdict::Keep(LeaseObservation {
            slot_id: record.slot_id,
            owner_ref: record.owner_ref.clone(),
            lease_token: token.to_string(),
            pid: Some(pid),
            heartbeat_age_secs: age,
            artifact_read: artifact.is_some(),
        }))
    }
}
