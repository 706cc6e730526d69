//! Durable connection-slot pool.
//!
//! The [`SlotPool`] hands out slot identifiers from a per-mode numeric range
//! stored in `SQLite`. Every lease carries a random token; release and
//! reclaim are compare-and-set on that token so a holder whose lease was
//! already reclaimed can never free someone else's slot.

use std::path::Path;
use std::time::Duration;

use slotwarden_core::config::HealthConfig;
use slotwarden_core::db::unix_timestamp;
use tracing::{debug, info};

use crate::storage::{Database, DatabaseError, ReleaseReason, SlotRange, SlotRecord, SlotStatus};

/// Thresholds used when judging whether a lease holder is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Leases with no process attached expire after this long.
    pub lease_ttl: Duration,
    /// A heartbeat older than this marks the holder stuck.
    pub heartbeat_timeout: Duration,
    /// Upper bound on one heartbeat read.
    pub probe_timeout: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for ReapPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl(),
            heartbeat_timeout: config.heartbeat_timeout(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Bounded registry of connection-slot identifiers.
#[derive(Clone)]
pub struct SlotPool {
    db: Database,
    policy: ReapPolicy,
}

impl SlotPool {
    /// Create a pool over `db`.
    pub const fn new(db: Database, policy: ReapPolicy) -> Self {
        Self { db, policy }
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub const fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// Materialise `size` slots for `mode` starting at `base`.
    ///
    /// Safe to call repeatedly; only missing rows are added and the range
    /// never shrinks.
    pub async fn ensure_sized(
        &self,
        mode: &str,
        base: i64,
        size: u32,
    ) -> Result<SlotRange, SlotPoolError> {
        if size == 0 {
            return Err(SlotPoolError::RangeConflict {
                mode: mode.to_string(),
                reason: "pool size must be at least 1".to_string(),
            });
        }

        let range = self
            .db
            .ensure_slot_range(mode, base, i64::from(size))
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict(reason) => SlotPoolError::RangeConflict {
                    mode: mode.to_string(),
                    reason,
                },
                other => SlotPoolError::Database(other),
            })?;

        debug!(mode, base = range.base, size = range.size, "Slot pool sized");
        Ok(range)
    }

    /// The slot range of `mode`.
    pub async fn range(&self, mode: &str) -> Result<SlotRange, SlotPoolError> {
        self.db
            .get_slot_range(mode)
            .await?
            .ok_or_else(|| SlotPoolError::UnknownMode {
                mode: mode.to_string(),
            })
    }

    /// Lease the lowest-numbered slot of `mode` that is not leased.
    ///
    /// Stale leases are reaped first, so exhaustion is never reported while
    /// a reclaimable slot exists. Callers must surface `PoolExhausted` as
    /// "busy, try later" rather than connecting anyway.
    pub async fn lease(
        &self,
        mode: &str,
        owner_ref: &str,
        output_path: &Path,
    ) -> Result<SlotRecord, SlotPoolError> {
        let range = self.range(mode).await?;

        self.reap_stale(
            mode,
            unix_timestamp(),
            self.policy.lease_ttl,
            self.policy.heartbeat_timeout,
        )
        .await?;

        let token = uuid::Uuid::new_v4().simple().to_string();
        let output = output_path.to_string_lossy();

        match self
            .db
            .lease_lowest_free(&range, owner_ref, &output, &token)
            .await
        {
            Ok(Some(record)) => {
                info!(mode, slot_id = record.slot_id, owner_ref, "Slot leased");
                Ok(record)
            }
            Ok(None) => Err(SlotPoolError::PoolExhausted {
                mode: mode.to_string(),
                size: range.size,
            }),
            Err(DatabaseError::Conflict(_)) => Err(SlotPoolError::DuplicateOwner {
                owner_ref: owner_ref.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a lease. Idempotent: returns `false` without touching
    /// anything when the token no longer holds a slot.
    pub async fn release(
        &self,
        lease_token: &str,
        reason: ReleaseReason,
    ) -> Result<bool, SlotPoolError> {
        let released = self
            .db
            .end_lease(lease_token, SlotStatus::Free, reason, unix_timestamp())
            .await?;

        if released {
            debug!(reason = %reason, "Lease released");
        } else {
            debug!(reason = %reason, "Release ignored, lease no longer held");
        }
        Ok(released)
    }

    /// Release every lease of `mode`. Returns the number released.
    pub async fn release_all(
        &self,
        mode: &str,
        reason: ReleaseReason,
    ) -> Result<u64, SlotPoolError> {
        let range = self.range(mode).await?;
        let released = self.db.release_range(&range, reason).await?;
        info!(mode, released, reason = %reason, "Released all leases");
        Ok(released)
    }

    /// Record the PID of the process launched for a lease.
    pub async fn attach_process(&self, lease_token: &str, pid: u32) -> Result<(), SlotPoolError> {
        if self.db.attach_process(lease_token, pid).await? {
            Ok(())
        } else {
            Err(SlotPoolError::LeaseTokenStale)
        }
    }

    /// Every slot of `mode`, lowest first.
    pub async fn slots(&self, mode: &str) -> Result<Vec<SlotRecord>, SlotPoolError> {
        let range = self.range(mode).await?;
        Ok(self.db.list_slots(&range).await?)
    }

    /// Leased slots of `mode`, lowest first.
    pub async fn leased(&self, mode: &str) -> Result<Vec<SlotRecord>, SlotPoolError> {
        let range = self.range(mode).await?;
        Ok(self.db.list_leased_slots(&range).await?)
    }

    /// A single slot by identifier.
    pub async fn slot(&self, slot_id: i64) -> Result<SlotRecord, SlotPoolError> {
        Ok(self.db.get_slot(slot_id).await?)
    }
}

/// Errors from slot pool operations.
#[derive(Debug, thiserror::Error)]
pub enum SlotPoolError {
    #[error("No free slot for mode {mode} ({size} slots, all leased)")]
    PoolExhausted { mode: String, size: i64 },

    #[error("Lease token no longer holds a slot")]
    LeaseTokenStale,

    #[error("Owner {owner_ref} already holds a lease")]
    DuplicateOwner { owner_ref: String },

    #[error("Invalid slot range for mode {mode}: {reason}")]
    RangeConflict { mode: String, reason: String },

    #[error("Mode {mode} has no slot pool")]
    UnknownMode { mode: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn pool_with(mode: &str, base: i64, size: u32) -> SlotPool {
        let db = Database::open_in_memory().await.unwrap();
        let pool = SlotPool::new(db, ReapPolicy::default());
        pool.ensure_sized(mode, base, size).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn exhaustion_then_reuse_lowest() {
        let pool = pool_with("paper", 1, 3).await;
        let mut leases = Vec::new();
        for i in 0..3 {
            let rec = pool
                .lease("paper", &format!("paper#{i}"), Path::new("/tmp/out"))
                .await
                .unwrap();
            assert_eq!(rec.slot_id, i64::from(i) + 1);
            leases.push(rec);
        }

        let err = pool
            .lease("paper", "paper#3", Path::new("/tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(err, SlotPoolError::PoolExhausted { size: 3, .. }));

        let token = leases[1].lease_token.clone().unwrap();
        assert!(pool.release(&token, ReleaseReason::Completed).await.unwrap());

        let again = pool
            .lease("paper", "paper#3", Path::new("/tmp/out"))
            .await
            .unwrap();
        assert_eq!(again.slot_id, 2);
        assert_ne!(again.lease_token, leases[1].lease_token);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool_with("paper", 1, 1).await;
        let rec = pool.lease("paper", "paper#0", Path::new("/o")).await.unwrap();
        let token = rec.lease_token.unwrap();

        assert!(pool.release(&token, ReleaseReason::Completed).await.unwrap());
        assert!(!pool.release(&token, ReleaseReason::Completed).await.unwrap());
        assert!(!pool.release("never-issued", ReleaseReason::Completed).await.unwrap());
    }

    #[tokio::test]
    async fn stale_token_cannot_attach() {
        let pool = pool_with("paper", 1, 1).await;
        let rec = pool.lease("paper", "paper#0", Path::new("/o")).await.unwrap();
        let token = rec.lease_token.unwrap();
        pool.attach_process(&token, 1234).await.unwrap();
        assert_eq!(pool.slot(1).await.unwrap().pid(), Some(1234));

        pool.release(&token, ReleaseReason::Restart).await.unwrap();
        let err = pool.attach_process(&token, 1234).await.unwrap_err();
        assert!(matches!(err, SlotPoolError::LeaseTokenStale));
    }

    #[tokio::test]
    async fn one_live_lease_per_owner() {
        let pool = pool_with("paper", 1, 3).await;
        pool.lease("paper", "paper#0", Path::new("/o")).await.unwrap();
        let err = pool.lease("paper", "paper#0", Path::new("/o")).await.unwrap_err();
        assert!(matches!(err, SlotPoolError::DuplicateOwner { .. }));
    }

    #[tokio::test]
    async fn modes_lease_from_their_own_range() {
        let pool = pool_with("paper", 1, 2).await;
        pool.ensure_sized("live", 101, 2).await.unwrap();

        let paper = pool.lease("paper", "paper#0", Path::new("/p")).await.unwrap();
        let live = pool.lease("live", "live#0", Path::new("/l")).await.unwrap();
        assert_eq!(paper.slot_id, 1);
        assert_eq!(live.slot_id, 101);

        let err = pool.ensure_sized("shadow", 2, 5).await.unwrap_err();
        assert!(matches!(err, SlotPoolError::RangeConflict { .. }));
    }

    #[tokio::test]
    async fn unknown_mode_is_reported() {
        let pool = pool_with("paper", 1, 1).await;
        let err = pool.lease("live", "live#0", Path::new("/l")).await.unwrap_err();
        assert!(matches!(err, SlotPoolError::UnknownMode { .. }));
    }

    #[tokio::test]
    async fn release_all_frees_the_mode() {
        let pool = pool_with("paper", 1, 3).await;
        for i in 0..3 {
            pool.lease("paper", &format!("paper#{i}"), Path::new("/o"))
                .await
                .unwrap();
        }
        assert_eq!(pool.release_all("paper", ReleaseReason::Reset).await.unwrap(), 3);
        assert!(pool.leased("paper").await.unwrap().is_empty());
        assert!(
            pool.slots("paper")
                .await
                .unwrap()
                .iter()
                .all(|s| s.release_reason.as_deref() == Some("reset"))
        );
    }
}
