//! Database queries for the slot pool.
//!
//! Every write that changes lease ownership is a single statement or a
//! transaction whose first statement is a write, so `SQLite`'s writer lock
//! serialises concurrent leases and reclaims.

use slotwarden_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{LeaderEvent, ReleaseReason, SlotRange, SlotRecord, SlotStatus};

const LEASE_LOWEST_FREE_SQL: &str = r"
    UPDATE slots
    SET status = 'leased', owner_ref = ?, output_path = ?, lease_token = ?,
        process_id = NULL, leased_at = ?, last_heartbeat = ?
    WHERE slot_id = (
        SELECT slot_id FROM slots
        WHERE slot_id BETWEEN ? AND ? AND status != 'leased'
        ORDER BY slot_id ASC
        LIMIT 1
    )
    RETURNING *
";

const END_LEASE_SQL: &str = r"
    UPDATE slots
    SET status = ?, owner_ref = NULL, process_id = NULL, output_path = NULL,
        lease_token = NULL, released_at = ?, release_reason = ?
    WHERE lease_token = ? AND status = 'leased'
";

impl Database {
    // =========================================================================
    // Slot range queries
    // =========================================================================

    /// Record the slot range of a mode and materialise its missing rows.
    ///
    /// Idempotent. The range only grows; a different `base` for an existing
    /// mode, or an overlap with another mode's range, is a `Conflict`.
    pub async fn ensure_slot_range(
        &self,
        mode: &str,
        base: i64,
        size: i64,
    ) -> Result<SlotRange, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        // Write first so the transaction holds the writer lock before reading.
        sqlx::query(
            r"
            INSERT INTO slot_pools (mode, base, size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(mode) DO UPDATE
                SET size = MAX(slot_pools.size, excluded.size),
                    updated_at = excluded.updated_at
                WHERE slot_pools.base = excluded.base
            ",
        )
        .bind(mode)
        .bind(base)
        .bind(size)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let range = sqlx::query_as::<_, SlotRange>("SELECT * FROM slot_pools WHERE mode = ?")
            .bind(mode)
            .fetch_one(&mut *tx)
            .await?;

        if range.base != base {
            return Err(DatabaseError::Conflict(format!(
                "mode {mode} is already sized at base {}",
                range.base
            )));
        }

        let overlapping: Option<String> = sqlx::query_scalar(
            "SELECT mode FROM slot_pools WHERE mode != ? AND base <= ? AND ? <= base + size - 1 LIMIT 1",
        )
        .bind(mode)
        .bind(range.last_slot())
        .bind(range.base)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(other) = overlapping {
            return Err(DatabaseError::Conflict(format!(
                "slot range {}..={} of mode {mode} overlaps mode {other}",
                range.base,
                range.last_slot()
            )));
        }

        for slot_id in range.base..=range.last_slot() {
            sqlx::query("INSERT INTO slots (slot_id) VALUES (?) ON CONFLICT(slot_id) DO NOTHING")
                .bind(slot_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(range)
    }

    /// Get the slot range of a mode.
    pub async fn get_slot_range(&self, mode: &str) -> Result<Option<SlotRange>, DatabaseError> {
        let range = sqlx::query_as::<_, SlotRange>("SELECT * FROM slot_pools WHERE mode = ?")
            .bind(mode)
            .fetch_optional(self.pool())
            .await?;

        Ok(range)
    }

    /// List all sized modes ordered by base.
    pub async fn list_slot_ranges(&self) -> Result<Vec<SlotRange>, DatabaseError> {
        let ranges = sqlx::query_as::<_, SlotRange>("SELECT * FROM slot_pools ORDER BY base ASC")
            .fetch_all(self.pool())
            .await?;

        Ok(ranges)
    }

    // =========================================================================
    // Slot queries
    // =========================================================================

    /// Get a slot by ID.
    pub async fn get_slot(&self, slot_id: i64) -> Result<SlotRecord, DatabaseError> {
        sqlx::query_as::<_, SlotRecord>("SELECT * FROM slots WHERE slot_id = ?")
            .bind(slot_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Slot {slot_id}")))
    }

    /// List every slot of a range, lowest first.
    pub async fn list_slots(&self, range: &SlotRange) -> Result<Vec<SlotRecord>, DatabaseError> {
        let slots = sqlx::query_as::<_, SlotRecord>(
            "SELECT * FROM slots WHERE slot_id BETWEEN ? AND ? ORDER BY slot_id ASC",
        )
        .bind(range.base)
        .bind(range.last_slot())
        .fetch_all(self.pool())
        .await?;

        Ok(slots)
    }

    /// List leased slots of a range, lowest first.
    pub async fn list_leased_slots(
        &self,
        range: &SlotRange,
    ) -> Result<Vec<SlotRecord>, DatabaseError> {
        let slots = sqlx::query_as::<_, SlotRecord>(
            "SELECT * FROM slots WHERE slot_id BETWEEN ? AND ? AND status = 'leased' ORDER BY slot_id ASC",
        )
        .bind(range.base)
        .bind(range.last_slot())
        .fetch_all(self.pool())
        .await?;

        Ok(slots)
    }

    /// Atomically lease the lowest non-leased slot of a range.
    ///
    /// Returns `None` when every slot of the range is leased. A second live
    /// lease for the same `owner_ref` fails with `Conflict`.
    pub async fn lease_lowest_free(
        &self,
        range: &SlotRange,
        owner_ref: &str,
        output_path: &str,
        lease_token: &str,
    ) -> Result<Option<SlotRecord>, DatabaseError> {
        let now = unix_timestamp();

        let record = sqlx::query_as::<_, SlotRecord>(LEASE_LOWEST_FREE_SQL)
            .bind(owner_ref)
            .bind(output_path)
            .bind(lease_token)
            .bind(now)
            .bind(now)
            .bind(range.base)
            .bind(range.last_slot())
            .fetch_optional(self.pool())
            .await?;

        Ok(record)
    }

    /// Attach the launched process to a lease. Returns `false` if the token
    /// no longer holds the slot.
    pub async fn attach_process(&self, lease_token: &str, pid: u32) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE slots SET process_id = ? WHERE lease_token = ? AND status = 'leased'",
        )
        .bind(i64::from(pid))
        .bind(lease_token)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Advance the stored heartbeat of a lease. Never moves it backwards.
    pub async fn record_heartbeat(
        &self,
        lease_token: &str,
        heartbeat: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE slots SET last_heartbeat = MAX(COALESCE(last_heartbeat, 0), ?) WHERE lease_token = ? AND status = 'leased'",
        )
        .bind(heartbeat)
        .bind(lease_token)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// End a lease if `lease_token` still holds it (compare-and-set).
    ///
    /// `status` is `Free` for an orderly release and `Failed` for a reclaim.
    /// Returns `false` when the token no longer matches.
    pub async fn end_lease(
        &self,
        lease_token: &str,
        status: SlotStatus,
        reason: ReleaseReason,
        at: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(END_LEASE_SQL)
            .bind(status.as_str())
            .bind(at)
            .bind(reason.as_str())
            .bind(lease_token)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release every lease in a range. Returns the number released.
    pub async fn release_range(
        &self,
        range: &SlotRange,
        reason: ReleaseReason,
    ) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            UPDATE slots
            SET status = 'free', owner_ref = NULL, process_id = NULL, output_path = NULL,
                lease_token = NULL, released_at = ?, release_reason = ?
            WHERE slot_id BETWEEN ? AND ? AND status = 'leased'
            ",
        )
        .bind(now)
        .bind(reason.as_str())
        .bind(range.base)
        .bind(range.last_slot())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Leader event queries
    // =========================================================================

    /// Record a leader promotion.
    pub async fn insert_leader_event(
        &self,
        mode: &str,
        old_slot_id: Option<i64>,
        new_slot_id: i64,
        reason: &str,
    ) -> Result<i64, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO leader_events (mode, old_slot_id, new_slot_id, reason, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(mode)
        .bind(old_slot_id)
        .bind(new_slot_id)
        .bind(reason)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent leader promotions of a mode, newest first.
    pub async fn list_leader_events(
        &self,
        mode: &str,
        limit: u32,
    ) -> Result<Vec<LeaderEvent>, DatabaseError> {
        let events = sqlx::query_as::<_, LeaderEvent>(
            "SELECT * FROM leader_events WHERE mode = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(mode)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn sized_db(mode: &str, base: i64, size: i64) -> (Database, SlotRange) {
        let db = Database::open_in_memory().await.unwrap();
        let range = db.ensure_slot_range(mode, base, size).await.unwrap();
        (db, range)
    }

    #[tokio::test]
    async fn ensure_slot_range_is_idempotent_and_never_shrinks() {
        let (db, range) = sized_db("paper", 1, 3).await;
        assert_eq!(db.list_slots(&range).await.unwrap().len(), 3);

        let grown = db.ensure_slot_range("paper", 1, 5).await.unwrap();
        assert_eq!(grown.size, 5);

        let same = db.ensure_slot_range("paper", 1, 2).await.unwrap();
        assert_eq!(same.size, 5);
        assert_eq!(db.list_slots(&same).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn ensure_slot_range_rejects_overlap_and_rebase() {
        let (db, _) = sized_db("paper", 1, 10).await;

        let err = db.ensure_slot_range("live", 5, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert!(db.get_slot_range("live").await.unwrap().is_none());

        let err = db.ensure_slot_range("paper", 2, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        db.ensure_slot_range("live", 11, 10).await.unwrap();
        assert_eq!(db.list_slot_ranges().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lease_takes_lowest_and_end_lease_clears_ownership() {
        let (db, range) = sized_db("paper", 1, 2).await;

        let first = db
            .lease_lowest_free(&range, "paper#0", "/tmp/a", "tok-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.slot_id, 1);
        assert!(first.is_leased());
        assert_eq!(first.leased_at, first.last_heartbeat);

        let second = db
            .lease_lowest_free(&range, "paper#1", "/tmp/b", "tok-b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.slot_id, 2);

        assert!(db
            .lease_lowest_free(&range, "paper#2", "/tmp/c", "tok-c")
            .await
            .unwrap()
            .is_none());

        assert!(db.attach_process("tok-a", 4242).await.unwrap());
        assert!(db
            .end_lease("tok-a", SlotStatus::Free, ReleaseReason::Completed, 10)
            .await
            .unwrap());
        let released = db.get_slot(1).await.unwrap();
        assert_eq!(released.slot_status(), SlotStatus::Free);
        assert!(released.process_id.is_none());
        assert!(released.output_path.is_none());
        assert!(released.lease_token.is_none());
        assert_eq!(released.release_reason.as_deref(), Some("completed"));

        // Stale token is a no-op.
        assert!(!db
            .end_lease("tok-a", SlotStatus::Free, ReleaseReason::Completed, 11)
            .await
            .unwrap());
        assert!(!db.attach_process("tok-a", 1).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_owner_is_a_conflict() {
        let (db, range) = sized_db("paper", 1, 3).await;
        db.lease_lowest_free(&range, "paper#0", "/tmp/a", "tok-a")
            .await
            .unwrap();
        let err = db
            .lease_lowest_free(&range, "paper#0", "/tmp/b", "tok-b")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        // The failed statement must not have consumed slot 2.
        assert_eq!(db.get_slot(2).await.unwrap().slot_status(), SlotStatus::Free);
    }

    #[tokio::test]
    async fn heartbeat_never_moves_backwards() {
        let (db, range) = sized_db("paper", 1, 1).await;
        let rec = db
            .lease_lowest_free(&range, "paper#0", "/tmp/a", "tok-a")
            .await
            .unwrap()
            .unwrap();
        let leased_at = rec.leased_at.unwrap();

        db.record_heartbeat("tok-a", leased_at + 30).await.unwrap();
        db.record_heartbeat("tok-a", leased_at + 5).await.unwrap();
        assert_eq!(
            db.get_slot(1).await.unwrap().last_heartbeat,
            Some(leased_at + 30)
        );
    }

    #[tokio::test]
    async fn release_range_only_touches_its_mode() {
        let db = Database::open_in_memory().await.unwrap();
        let paper = db.ensure_slot_range("paper", 1, 2).await.unwrap();
        let live = db.ensure_slot_range("live", 101, 2).await.unwrap();
        db.lease_lowest_free(&paper, "paper#0", "/p", "p0").await.unwrap();
        db.lease_lowest_free(&live, "live#0", "/l", "l0").await.unwrap();

        assert_eq!(db.release_range(&paper, ReleaseReason::Reset).await.unwrap(), 1);
        assert!(db.list_leased_slots(&paper).await.unwrap().is_empty());
        assert_eq!(db.list_leased_slots(&live).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leader_events_newest_first() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_leader_event("paper", None, 1, "initial").await.unwrap();
        db.insert_leader_event("paper", Some(1), 2, "process_exited")
            .await
            .unwrap();
        db.insert_leader_event("live", None, 101, "initial").await.unwrap();

        let events = db.list_leader_events("paper", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_slot_id, 2);
        assert_eq!(events[0].old_slot_id, Some(1));
    }
}
