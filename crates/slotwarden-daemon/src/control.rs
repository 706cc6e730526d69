//! Operator control surface over the fleet manager.
//!
//! This is the boundary an HTTP layer would call into. Destructive resets
//! need a confirmation token obtained from [`ControlPlane::request_reset`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::fleet::{FleetError, FleetManager, FleetSnapshot};
use crate::storage::LeaderEvent;

/// How long a reset confirmation token stays valid.
pub const RESET_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Reason recorded for a manual promotion.
pub const OPERATOR_PROMOTE_REASON: &str = "operator_promote";

/// Token an operator must echo back to confirm a reset.
#[derive(Debug, Clone, Serialize)]
pub struct ResetChallenge {
    pub mode: String,
    pub token: String,
    pub expires_in_secs: u64,
}

struct PendingReset {
    token: String,
    expires_at: Instant,
}

pub struct ControlPlane {
    manager: Arc<FleetManager>,
    pending: Mutex<HashMap<String, PendingReset>>,
    reset_ttl: Duration,
}

impl ControlPlane {
    pub fn new(manager: Arc<FleetManager>) -> Self {
        Self {
            manager,
            pending: Mutex::new(HashMap::new()),
            reset_ttl: RESET_TOKEN_TTL,
        }
    }

    #[must_use]
    pub const fn with_reset_ttl(mut self, ttl: Duration) -> Self {
        self.reset_ttl = ttl;
        self
    }

    pub const fn manager(&self) -> &Arc<FleetManager> {
        &self.manager
    }

    pub async fn status(&self, mode: &str) -> Result<FleetSnapshot, FleetError> {
        self.manager.status(mode).await
    }

    /// Restart one instance on operator request. A held instance has its
    /// hold lifted first; otherwise the restart counts toward the ceiling
    /// like any other.
    pub async fn restart(&self, mode: &str, slot_id: i64) -> Result<i64, FleetError> {
        let released = self.manager.clear_hold(mode, slot_id).await?;
        let new_slot = self.manager.restart_instance(mode, slot_id).await?;
        info!(mode, slot_id, new_slot, released_hold = released, "Operator restart");
        Ok(new_slot)
    }

    /// Hand leadership to the lowest healthy Worker.
    pub async fn promote(&self, mode: &str) -> Result<i64, FleetError> {
        self.manager
            .on_leader_lost(mode, OPERATOR_PROMOTE_REASON)
            .await
    }

    pub async fn leader_events(&self, mode: &str, limit: u32) -> Result<Vec<LeaderEvent>, FleetError> {
        self.manager.leader_events(mode, limit).await
    }

    /// Issue a one-time token confirming a reset of `mode`. A new request
    /// replaces any outstanding token.
    pub async fn request_reset(&self, mode: &str) -> Result<ResetChallenge, FleetError> {
        self.manager.status(mode).await?;

        let token = uuid::Uuid::new_v4().simple().to_string();
        self.pending.lock().await.insert(
            mode.to_string(),
            PendingReset {
                token: token.clone(),
                expires_at: Instant::now() + self.reset_ttl,
            },
        );

        info!(mode, "Reset confirmation issued");
        Ok(ResetChallenge {
            mode: mode.to_string(),
            token,
            expires_in_secs: self.reset_ttl.as_secs(),
        })
    }

    /// Stop the fleet, release every lease of the mode, and start over.
    pub async fn reset(&self, mode: &str, token: &str) -> Result<FleetSnapshot, FleetError> {
        {
            let mut pending = self.pending.lock().await;
            let valid = pending
                .get(mode)
                .is_some_and(|p| p.token == token && Instant::now() < p.expires_at);
            if !valid {
                warn!(mode, "Reset rejected: bad or expired confirmation");
                return Err(FleetError::InvalidConfirmation);
            }
            pending.remove(mode);
        }

        self.manager.reset(mode).await
    }
}
