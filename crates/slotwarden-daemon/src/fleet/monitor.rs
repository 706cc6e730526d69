//! Periodic health sweep over every active fleet.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::manager::FleetManager;
use super::types::ModeSweep;

/// Result of one pass over all active fleets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub modes: Vec<ModeSweep>,
}

impl SweepReport {
    pub fn reclaimed(&self) -> usize {
        self.modes.iter().map(|m| m.reclaimed).sum()
    }

    pub fn promotions(&self) -> usize {
        self.modes.iter().filter(|m| m.promoted.is_some()).count()
    }

    pub fn restarts(&self) -> usize {
        self.modes.iter().map(|m| m.restarted.len()).sum()
    }

    pub fn failures(&self) -> usize {
        self.modes.iter().map(|m| m.failures.len()).sum()
    }

    pub fn is_quiet(&self) -> bool {
        self.reclaimed() == 0 && self.promotions() == 0 && self.failures() == 0
    }
}

/// Drives [`FleetManager::sweep`] on a fixed interval.
pub struct HealthMonitor {
    manager: Arc<FleetManager>,
    interval: Duration,
}

impl HealthMonitor {
    pub const fn new(manager: Arc<FleetManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Sweep every active mode once. A failing mode is logged and does not
    /// stop the others.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for mode in self.manager.active_modes().await {
            match self.manager.sweep(&mode).await {
                Ok(sweep) => {
                    #[cfg(feature = "metrics")]
                    slotwarden_core::metrics::record_sweep(
                        &mode,
                        u64::try_from(sweep.reclaimed).unwrap_or(u64::MAX),
                        u64::from(sweep.promoted.is_some()),
                        u64::try_from(sweep.restarted.len()).unwrap_or(u64::MAX),
                    );
                    report.modes.push(sweep);
                }
                Err(e) => {
                    error!(mode, error = %e, "Health sweep failed");
                    report.modes.push(ModeSweep {
                        failures: vec![e.to_string()],
                        mode,
                        ..ModeSweep::default()
                    });
                }
            }
        }

        if !report.is_quiet() {
            warn!(
                reclaimed = report.reclaimed(),
                promotions = report.promotions(),
                restarts = report.restarts(),
                failures = report.failures(),
                "Health sweep acted"
            );
        }
        report
    }

    /// Spawn the sweep loop. Ends when `shutdown` changes.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            info!(interval_ms = self.interval.as_millis(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.sweep_once().await;
                    }
                    _ = shutdown.changed() => {
                        info!("Health monitor shutting down");
                        return;
                    }
                }
            }
        })
    }
}
