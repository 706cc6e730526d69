//! Fleet manager: one Leader and N Workers per mode.
//!
//! Each mode's fleet sits behind its own `RwLock`. Role changes (promotion,
//! applying a sweep, installing a replacement) hold the write lock, so
//! readers always see exactly one Leader. Slow work (heartbeat probes,
//! leasing and spawning replacements) runs outside the lock.
//!
//! Order routing never touches the lock: the set of healthy Workers is
//! published through a `watch` channel after every change.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use slotwarden_core::config::{Config, ModeConfig};
use slotwarden_core::db::unix_timestamp;
use tokio::sync::{RwLock, RwLockWriteGuard, watch};
use tracing::{debug, info, warn};

use super::output;
use super::types::{
    FleetError, FleetInstance, FleetSnapshot, FleetState, Health, InstanceSnapshot, ModeSweep,
    Role, owner_ref, parse_owner_ref,
};
use crate::process::{LaunchRequest, Launcher, ProcessHandle, heartbeat_path};
use crate::slots::{ReapReport, SlotPool, SlotPoolError};
use crate::storage::{LeaderEvent, ReleaseReason};

/// Reason recorded when a fleet elects its first Leader.
const START_REASON: &str = "fleet_start";

/// Reason recorded when an instance's lease vanished between sweeps.
const LEASE_LOST_REASON: &str = "lease_lost";

/// Fleet-wide settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Parent of every mode's output directories and link.
    pub run_dir: PathBuf,
    pub restart_ceiling: u32,
    pub restart_window: Duration,
    pub heartbeat_timeout: Duration,
}

impl FleetSettings {
    pub fn from_config(config: &Config, run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            restart_ceiling: config.restart.ceiling,
            restart_window: config.restart.window(),
            heartbeat_timeout: config.health.heartbeat_timeout(),
        }
    }
}

struct Fleet {
    mode: String,
    state: FleetState,
    target_size: u32,
    instances: Vec<FleetInstance>,
}

impl Fleet {
    fn new(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            state: FleetState::Uninitialized,
            target_size: 0,
            instances: Vec::new(),
        }
    }

    fn leader_index(&self) -> Option<usize> {
        self.instances.iter().position(FleetInstance::is_leader)
    }

    /// Instance on `slot_id`. A dead instance may still name a slot that a
    /// replacement has since leased; the live holder wins.
    fn index_of(&self, slot_id: i64) -> Result<usize, FleetError> {
        let on_slot = |i: &FleetInstance| i.slot_id == Some(slot_id);
        self.instances
            .iter()
            .position(|i| on_slot(i) && i.health != Health::Dead)
            .or_else(|| self.instances.iter().position(on_slot))
            .ok_or_else(|| FleetError::InstanceNotFound {
                mode: self.mode.clone(),
                slot_id,
            })
    }

    fn refresh_state(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let leaders = self.instances.iter().filter(|i| i.is_leader()).count();
        let complete = self.instances.len() == self.target_size as usize
            && self
                .instances
                .iter()
                .all(|i| !i.held && i.health != Health::Dead);
        let next = if complete && leaders == 1 {
            FleetState::Running
        } else {
            FleetState::Degraded
        };
        if next != self.state {
            info!(mode = %self.mode, from = ?self.state, to = ?next, "Fleet state changed");
            self.state = next;
        }
    }

    fn snapshot(&self) -> FleetSnapshot {
        let leader = self.leader_index().and_then(|i| self.instances.get(i));
        FleetSnapshot {
            mode: self.mode.clone(),
            state: self.state,
            target_size: self.target_size,
            leader_slot: leader.and_then(|l| l.slot_id),
            leader_output: leader.map(|l| l.output_path.clone()),
            instances: self.instances.iter().map(InstanceSnapshot::from).collect(),
        }
    }
}

/// What order routing may see without taking the fleet lock.
#[derive(Debug, Default)]
struct RouteTable {
    /// Slots currently held by an instance.
    members: Vec<i64>,
    /// Healthy Workers, lowest slot first.
    workers: Vec<i64>,
}

/// A fleet plus its lock-free routing view.
struct FleetEntry {
    fleet: RwLock<Fleet>,
    routes: watch::Sender<RouteTable>,
    /// Slots callers marked stale, not yet folded into the fleet.
    demoted: std::sync::Mutex<HashMap<i64, Instant>>,
    cursor: AtomicUsize,
}

impl FleetEntry {
    fn new(mode: &str) -> Self {
        let (routes, _) = watch::channel(RouteTable::default());
        Self {
            fleet: RwLock::new(Fleet::new(mode)),
            routes,
            demoted: std::sync::Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    fn demoted(&self) -> MutexGuard<'_, HashMap<i64, Instant>> {
        self.demoted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write-lock the fleet with pending demotions applied.
    async fn write(&self) -> RwLockWriteGuard<'_, Fleet> {
        let mut guard = self.fleet.write().await;
        self.fold_demotions(&mut guard, None);
        guard
    }

    /// Turn pending demotions into `Stale` health. With `vouched_after`,
    /// demotions older than that instant are dropped instead: the sweep
    /// that started then has judged those instances afresh.
    fn fold_demotions(&self, fleet: &mut Fleet, vouched_after: Option<Instant>) {
        let pending: Vec<(i64, Instant)> = self.demoted().drain().collect();
        for (slot_id, at) in pending {
            if vouched_after.is_some_and(|started| at < started) {
                continue;
            }
            if let Some(instance) = fleet
                .instances
                .iter_mut()
                .find(|i| i.slot_id == Some(slot_id) && i.health == Health::Healthy)
            {
                instance.health = Health::Stale;
            }
        }
    }

    /// Republish the routing view from the fleet's current state.
    fn publish(&self, fleet: &Fleet) {
        let demoted = self.demoted();
        let members = fleet.instances.iter().filter_map(|i| i.slot_id).collect();
        let mut workers: Vec<i64> = fleet
            .instances
            .iter()
            .filter(|i| i.is_available_worker())
            .filter_map(|i| i.slot_id)
            .filter(|slot_id| !demoted.contains_key(slot_id))
            .collect();
        workers.sort_unstable();
        drop(demoted);
        self.routes.send_replace(RouteTable { members, workers });
    }

    /// Take `slot_id` out of rotation at once. `false` if no instance holds it.
    fn demote(&self, slot_id: i64) -> bool {
        if !self.routes.borrow().members.contains(&slot_id) {
            return false;
        }
        self.demoted().insert(slot_id, Instant::now());
        self.routes
            .send_modify(|routes| routes.workers.retain(|w| *w != slot_id));
        true
    }

    /// Round-robin over published Workers, skipping `exclude`.
    fn next_worker(&self, exclude: Option<i64>) -> Option<i64> {
        let routes = self.routes.borrow();
        let candidates: Vec<i64> = routes
            .workers
            .iter()
            .copied()
            .filter(|w| Some(*w) != exclude)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        candidates.get(turn % candidates.len()).copied()
    }

    fn snapshot(&self, fleet: &Fleet) -> FleetSnapshot {
        let mut snapshot = fleet.snapshot();
        let demoted = self.demoted();
        for instance in &mut snapshot.instances {
            if instance.health == Health::Healthy
                && instance.slot_id.is_some_and(|s| demoted.contains_key(&s))
            {
                instance.health = Health::Stale;
            }
        }
        snapshot
    }
}

/// Result of a successful lease and spawn.
struct Launched {
    slot_id: i64,
    pid: u32,
    output_path: PathBuf,
    lease_token: String,
}

impl Launched {
    fn into_instance(self, ordinal: u32, role: Role) -> FleetInstance {
        FleetInstance {
            ordinal,
            slot_id: Some(self.slot_id),
            role,
            pid: Some(self.pid),
            output_path: self.output_path,
            health: Health::Healthy,
            lease_token: self.lease_token,
            restarts: VecDeque::new(),
            held: false,
            relaunching: false,
            leased_at: Instant::now(),
        }
    }
}

/// A restart prepared under the fleet lock, launched after releasing it.
struct Relaunch {
    mode: String,
    ordinal: u32,
    role: Role,
    old_slot: Option<i64>,
}

fn stop_process(slot_id: Option<i64>, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = ProcessHandle::new(pid, PathBuf::new()).terminate() {
        warn!(slot_id = ?slot_id, pid, error = %e, "Failed to stop process");
    }
}

/// Supervises one fleet per mode.
pub struct FleetManager {
    pool: SlotPool,
    launcher: Arc<dyn Launcher>,
    settings: FleetSettings,
    modes: BTreeMap<String, ModeConfig>,
    fleets: RwLock<HashMap<String, Arc<FleetEntry>>>,
}

impl FleetManager {
    pub fn new(
        pool: SlotPool,
        launcher: Arc<dyn Launcher>,
        settings: FleetSettings,
        modes: BTreeMap<String, ModeConfig>,
    ) -> Self {
        Self {
            pool,
            launcher,
            settings,
            modes,
            fleets: RwLock::new(HashMap::new()),
        }
    }

    pub const fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub const fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// Directory holding a mode's instance directories and output link.
    pub fn mode_dir(&self, mode: &str) -> PathBuf {
        self.settings.run_dir.join(mode)
    }

    fn instance_dir(&self, mode: &str, ordinal: u32) -> PathBuf {
        self.mode_dir(mode).join(format!("instance-{ordinal}"))
    }

    /// Modes whose fleet is currently active.
    pub async fn active_modes(&self) -> Vec<String> {
        let entries: Vec<_> = self
            .fleets
            .read()
            .await
            .iter()
            .map(|(mode, entry)| (mode.clone(), Arc::clone(entry)))
            .collect();

        let mut active = Vec::new();
        for (mode, entry) in entries {
            if entry.fleet.read().await.state.is_active() {
                active.push(mode);
            }
        }
        active.sort();
        active
    }

    async fn fleet(&self, mode: &str) -> Result<Arc<FleetEntry>, FleetError> {
        if let Some(entry) = self.fleets.read().await.get(mode) {
            return Ok(Arc::clone(entry));
        }
        if self.modes.contains_key(mode) {
            Err(FleetError::NotRunning {
                mode: mode.to_string(),
            })
        } else {
            Err(FleetError::UnknownMode {
                mode: mode.to_string(),
            })
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Size the pool, adopt live leases from a previous run, and launch the
    /// rest of the fleet. The first running instance (or the adopted
    /// instance the output link already points at) becomes Leader.
    ///
    /// Instances that fail to launch are kept as dead placeholders and the
    /// fleet starts `Degraded`; start fails only when nothing runs.
    pub async fn start(&self, mode: &str, size: u32) -> Result<FleetSnapshot, FleetError> {
        let config = *self
            .modes
            .get(mode)
            .ok_or_else(|| FleetError::UnknownMode {
                mode: mode.to_string(),
            })?;

        let entry = {
            let mut fleets = self.fleets.write().await;
            Arc::clone(
                fleets
                    .entry(mode.to_string())
                    .or_insert_with(|| Arc::new(FleetEntry::new(mode))),
            )
        };

        let mut guard = entry.write().await;
        if guard.state.is_active() {
            return Err(FleetError::AlreadyRunning {
                mode: mode.to_string(),
            });
        }
        guard.state = FleetState::Sizing;
        guard.target_size = size;
        guard.instances.clear();

        let result = match self.populate(&mut guard, config, size).await {
            Ok(()) => {
                guard.state = FleetState::Running;
                guard.refresh_state();
                info!(mode, size, state = ?guard.state, "Fleet started");
                Ok(entry.snapshot(&guard))
            }
            Err(e) => {
                warn!(mode, error = %e, "Fleet start failed, tearing down");
                self.teardown(&mut guard, ReleaseReason::SpawnFailed).await;
                guard.state = FleetState::Uninitialized;
                Err(e)
            }
        };
        entry.publish(&guard);
        result
    }

    async fn populate(
        &self,
        fleet: &mut Fleet,
        config: ModeConfig,
        size: u32,
    ) -> Result<(), FleetError> {
        let mode = fleet.mode.clone();
        self.pool
            .ensure_sized(&mode, config.base, size.max(config.pool_size))
            .await?;

        self.adopt(fleet, size).await?;

        let adopted: HashSet<u32> = fleet.instances.iter().map(|i| i.ordinal).collect();
        let mut last_failure = None;
        for ordinal in (0..size).filter(|o| !adopted.contains(o)) {
            match self.launch(&mode, ordinal).await {
                Ok(launched) => fleet
                    .instances
                    .push(launched.into_instance(ordinal, Role::Worker)),
                Err(e) => {
                    warn!(mode, ordinal, error = %e, "Instance failed to launch, left for the sweep");
                    fleet
                        .instances
                        .push(FleetInstance::unlaunched(ordinal, self.instance_dir(&mode, ordinal)));
                    last_failure = Some(e);
                }
            }
        }
        fleet.instances.sort_by_key(|i| i.ordinal);

        let running = |i: &FleetInstance| i.health != Health::Dead;
        if let Some(e) = last_failure {
            if !fleet.instances.iter().any(running) {
                return Err(e);
            }
        }

        let mode_dir = self.mode_dir(&mode);
        let leader_idx = output::current_target(&mode_dir)
            .and_then(|target| {
                fleet
                    .instances
                    .iter()
                    .position(|i| running(i) && i.output_path == target)
            })
            .or_else(|| fleet.instances.iter().position(running));

        if let Some(leader) = leader_idx.and_then(|idx| fleet.instances.get_mut(idx)) {
            leader.role = Role::Leader;
            output::point_current(&mode_dir, &leader.output_path)?;
            if let Some(slot_id) = leader.slot_id {
                self.pool
                    .db()
                    .insert_leader_event(&mode, None, slot_id, START_REASON)
                    .await?;
            }
            info!(mode, slot_id = ?leader.slot_id, "Leader elected");
        }
        Ok(())
    }

    /// Take over leases a previous supervisor left behind. Live holders
    /// that fit this fleet are kept; everything else is stopped and
    /// released.
    async fn adopt(&self, fleet: &mut Fleet, size: u32) -> Result<(), FleetError> {
        let mode = fleet.mode.clone();
        for record in self.pool.leased(&mode).await? {
            let Some(token) = record.lease_token.clone() else {
                continue;
            };
            let ordinal = record
                .owner_ref
                .as_deref()
                .and_then(|owner| parse_owner_ref(&mode, owner));
            let handle = record
                .pid()
                .map(|pid| ProcessHandle::new(pid, PathBuf::new()));
            let alive = handle.as_ref().is_some_and(ProcessHandle::is_alive);

            match (ordinal, record.pid()) {
                (Some(ordinal), Some(pid))
                    if alive
                        && ordinal < size
                        && !fleet.instances.iter().any(|i| i.ordinal == ordinal) =>
                {
                    info!(mode, slot_id = record.slot_id, ordinal, pid, "Adopted live lease");
                    let launched = Launched {
                        slot_id: record.slot_id,
                        pid,
                        output_path: record
                            .output_dir()
                            .unwrap_or_else(|| self.instance_dir(&mode, ordinal)),
                        lease_token: token,
                    };
                    fleet
                        .instances
                        .push(launched.into_instance(ordinal, Role::Worker));
                }
                _ => {
                    if alive {
                        stop_process(Some(record.slot_id), record.pid());
                    }
                    self.pool.release(&token, ReleaseReason::Orphaned).await?;
                    info!(mode, slot_id = record.slot_id, owner_ref = ?record.owner_ref, "Released orphaned lease");
                }
            }
        }
        Ok(())
    }

    /// Lease a slot for `ordinal` and launch its process.
    async fn launch(&self, mode: &str, ordinal: u32) -> Result<Launched, FleetError> {
        let output_path = self.instance_dir(mode, ordinal);
        tokio::fs::create_dir_all(&output_path).await?;
        // A heartbeat left by the previous occupant must not vouch for the new one.
        match tokio::fs::remove_file(heartbeat_path(&output_path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let record = self
            .pool
            .lease(mode, &owner_ref(mode, ordinal), &output_path)
            .await?;
        let Some(token) = record.lease_token.clone() else {
            return Err(SlotPoolError::LeaseTokenStale.into());
        };

        let request = LaunchRequest {
            mode: mode.to_string(),
            slot_id: record.slot_id,
            output_path: output_path.clone(),
            heartbeat_path: heartbeat_path(&output_path),
        };

        let pid = match self.launcher.spawn(&request) {
            Ok(pid) => pid,
            Err(e) => {
                self.pool.release(&token, ReleaseReason::SpawnFailed).await?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.pool.attach_process(&token, pid).await {
            stop_process(Some(record.slot_id), Some(pid));
            return Err(e.into());
        }

        info!(mode, slot_id = record.slot_id, ordinal, pid, "Instance launched");
        Ok(Launched {
            slot_id: record.slot_id,
            pid,
            output_path,
            lease_token: token,
        })
    }

    async fn teardown(&self, fleet: &mut Fleet, reason: ReleaseReason) {
        for instance in fleet.instances.drain(..) {
            stop_process(instance.slot_id, instance.pid);
            if instance.lease_token.is_empty() {
                continue;
            }
            if let Err(e) = self.pool.release(&instance.lease_token, reason).await {
                warn!(mode = %fleet.mode, slot_id = ?instance.slot_id, error = %e, "Failed to release lease");
            }
        }
    }

    /// Terminate every process of `mode` and release its leases.
    pub async fn stop(&self, mode: &str) -> Result<(), FleetError> {
        let entry = self.fleet(mode).await?;
        let mut guard = entry.write().await;
        if !guard.state.is_active() {
            return Err(FleetError::NotRunning {
                mode: mode.to_string(),
            });
        }
        self.teardown(&mut guard, ReleaseReason::Shutdown).await;
        guard.state = FleetState::Uninitialized;
        entry.publish(&guard);
        drop(guard);
        info!(mode, "Fleet stopped");
        Ok(())
    }

    /// Stop every active fleet.
    pub async fn shutdown(&self) {
        for mode in self.active_modes().await {
            if let Err(e) = self.stop(&mode).await {
                warn!(mode, error = %e, "Failed to stop fleet");
            }
        }
    }

    /// Hard stop, release every lease in the mode's range, then start again
    /// with the same target size.
    pub async fn reset(&self, mode: &str) -> Result<FleetSnapshot, FleetError> {
        let entry = self.fleet(mode).await?;
        let target = {
            let mut guard = entry.write().await;
            if guard.state.is_active() {
                self.teardown(&mut guard, ReleaseReason::Reset).await;
                guard.state = FleetState::Uninitialized;
                entry.publish(&guard);
            }
            guard.target_size
        };

        let released = self.pool.release_all(mode, ReleaseReason::Reset).await?;
        match std::fs::remove_file(output::link_path(&self.mode_dir(mode))) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        warn!(mode, released, target, "Fleet reset");

        self.start(mode, target).await
    }

    // =========================================================================
    // Order flow
    // =========================================================================

    /// Pick the next healthy Worker by round-robin over cached health.
    /// Never waits on the fleet lock.
    pub async fn select_worker(&self, mode: &str) -> Result<i64, FleetError> {
        let entry = self.fleet(mode).await?;
        entry
            .next_worker(None)
            .ok_or_else(|| FleetError::NoHealthyWorker {
                mode: mode.to_string(),
            })
    }

    /// Run `submit` on a selected Worker. On failure the Worker is marked
    /// stale and the call is retried once on a different healthy Worker.
    pub async fn submit_with_retry<F, Fut, T, E>(
        &self,
        mode: &str,
        mut submit: F,
    ) -> Result<T, FleetError>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let first = self.select_worker(mode).await?;
        let first_err = match submit(first).await {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };
        warn!(mode, slot_id = first, error = %first_err, "Submission failed, retrying on another worker");
        self.mark_stale(mode, first).await?;

        let Some(second) = self.fleet(mode).await?.next_worker(Some(first)) else {
            return Err(FleetError::SubmissionFailed {
                reason: format!("slot {first}: {first_err}; no other healthy worker"),
            });
        };

        match submit(second).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.mark_stale(mode, second).await?;
                Err(FleetError::SubmissionFailed {
                    reason: format!("slot {first}: {first_err}; slot {second}: {e}"),
                })
            }
        }
    }

    /// Exclude an instance from selection until the next sweep vouches for
    /// it. Takes effect immediately, even while a sweep holds the fleet.
    pub async fn mark_stale(&self, mode: &str, slot_id: i64) -> Result<(), FleetError> {
        let entry = self.fleet(mode).await?;
        if entry.demote(slot_id) {
            debug!(mode, slot_id, "Worker marked stale");
            Ok(())
        } else {
            Err(FleetError::InstanceNotFound {
                mode: mode.to_string(),
                slot_id,
            })
        }
    }

    // =========================================================================
    // Leadership
    // =========================================================================

    /// Promote the lowest-numbered healthy Worker and repoint the output link.
    /// Returns the new Leader's slot.
    pub async fn on_leader_lost(&self, mode: &str, reason: &str) -> Result<i64, FleetError> {
        let entry = self.fleet(mode).await?;
        let mut guard = entry.write().await;
        let result = self.promote(&mut guard, reason).await;
        guard.refresh_state();
        entry.publish(&guard);
        result
    }

    async fn promote(&self, fleet: &mut Fleet, reason: &str) -> Result<i64, FleetError> {
        let mode = fleet.mode.clone();
        let (candidate, new_slot) = fleet
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_available_worker())
            .filter_map(|(idx, i)| i.slot_id.map(|slot_id| (idx, slot_id)))
            .min_by_key(|(_, slot_id)| *slot_id)
            .ok_or_else(|| FleetError::NoHealthyWorker { mode: mode.clone() })?;

        let old = fleet.leader_index();
        output::point_current(&self.mode_dir(&mode), &fleet.instances[candidate].output_path)?;

        let old_slot = old.and_then(|idx| fleet.instances[idx].slot_id);
        if let Some(idx) = old {
            fleet.instances[idx].role = Role::Worker;
        }
        fleet.instances[candidate].role = Role::Leader;
        warn!(mode, old_slot = ?old_slot, new_slot, reason, "Leader promoted");

        // The promotion already happened; a lost audit row does not undo it.
        if let Err(e) = self
            .pool
            .db()
            .insert_leader_event(&mode, old_slot, new_slot, reason)
            .await
        {
            warn!(mode, new_slot, error = %e, "Failed to record leader event");
        }
        Ok(new_slot)
    }

    /// The Leader on `slot_id` cannot write its output: stop it and fail
    /// over. Returns the new Leader's slot.
    pub async fn report_output_failure(&self, mode: &str, slot_id: i64) -> Result<i64, FleetError> {
        let entry = self.fleet(mode).await?;
        let mut guard = entry.write().await;
        let idx = guard.index_of(slot_id)?;
        let instance = &mut guard.instances[idx];
        if !instance.is_leader() {
            return Err(FleetError::NotLeader { slot_id });
        }

        warn!(mode, slot_id, "Leader output failed");
        instance.health = Health::Dead;
        stop_process(Some(slot_id), instance.pid.take());
        let token = instance.lease_token.clone();
        self.pool.release(&token, ReleaseReason::OutputFailure).await?;

        let result = self.promote(&mut guard, "output_failure").await;
        guard.refresh_state();
        entry.publish(&guard);
        result
    }

    /// Audit trail of promotions, newest first.
    pub async fn leader_events(&self, mode: &str, limit: u32) -> Result<Vec<LeaderEvent>, FleetError> {
        if !self.modes.contains_key(mode) {
            return Err(FleetError::UnknownMode {
                mode: mode.to_string(),
            });
        }
        Ok(self.pool.db().list_leader_events(mode, limit).await?)
    }

    // =========================================================================
    // Restarts
    // =========================================================================

    /// Relaunch the instance on `slot_id`, keeping its role. Returns the slot
    /// leased by the replacement.
    pub async fn restart_instance(&self, mode: &str, slot_id: i64) -> Result<i64, FleetError> {
        let entry = self.fleet(mode).await?;
        let relaunch = {
            let mut guard = entry.write().await;
            let idx = guard.index_of(slot_id)?;
            let prepared = self.prepare_restart(&mut guard, idx).await;
            guard.refresh_state();
            entry.publish(&guard);
            prepared?
        };
        self.relaunch(&entry, relaunch).await
    }

    /// Lift a restart hold and forget the instance's restart history.
    /// Returns whether the instance was held; a running instance keeps
    /// its history.
    pub async fn clear_hold(&self, mode: &str, slot_id: i64) -> Result<bool, FleetError> {
        let entry = self.fleet(mode).await?;
        let mut guard = entry.write().await;
        let idx = guard.index_of(slot_id)?;
        let instance = &mut guard.instances[idx];
        if !instance.held {
            return Ok(false);
        }
        instance.held = false;
        instance.restarts.clear();
        info!(mode, slot_id, "Restart hold cleared");
        guard.refresh_state();
        entry.publish(&guard);
        Ok(true)
    }

    /// Check the ceiling, stop the old process and release its lease. The
    /// instance is left dead and marked relaunching.
    async fn prepare_restart(&self, fleet: &mut Fleet, idx: usize) -> Result<Relaunch, FleetError> {
        let mode = fleet.mode.clone();
        let now = Instant::now();
        let ceiling = self.settings.restart_ceiling;
        let window = self.settings.restart_window;

        let instance = &mut fleet.instances[idx];
        if instance.relaunching {
            return Err(FleetError::RestartInProgress {
                mode,
                ordinal: instance.ordinal,
            });
        }
        instance.prune_restarts(now, window);
        let exceeded = instance.restarts.len() >= ceiling as usize;

        let old_slot = instance.slot_id;
        instance.health = Health::Dead;
        instance.held = exceeded;
        instance.relaunching = !exceeded;
        if !exceeded {
            instance.restarts.push_back(now);
        }
        stop_process(old_slot, instance.pid.take());
        let token = std::mem::take(&mut instance.lease_token);
        let (ordinal, role) = (instance.ordinal, instance.role);

        if !token.is_empty() {
            if let Err(e) = self.pool.release(&token, ReleaseReason::Restart).await {
                fleet.instances[idx].relaunching = false;
                return Err(e.into());
            }
        }

        if exceeded {
            warn!(mode, ordinal, slot_id = ?old_slot, ceiling, "Restart ceiling exceeded, instance held");
            return Err(FleetError::RestartCeilingExceeded {
                ordinal,
                ceiling,
                window_secs: window.as_secs(),
            });
        }
        Ok(Relaunch {
            mode,
            ordinal,
            role,
            old_slot,
        })
    }

    /// Launch a prepared restart without the fleet lock, then install it.
    async fn relaunch(&self, entry: &FleetEntry, relaunch: Relaunch) -> Result<i64, FleetError> {
        let Relaunch {
            mode,
            ordinal,
            role,
            old_slot,
        } = relaunch;
        let launched = self.launch(&mode, ordinal).await;

        let mut guard = entry.write().await;
        let idx = guard
            .instances
            .iter()
            .position(|i| i.ordinal == ordinal && i.relaunching);

        let result = match (idx, launched) {
            (Some(idx), Ok(fresh)) if guard.state.is_active() => {
                let new_slot = fresh.slot_id;
                let instance = &mut guard.instances[idx];
                let restarts = std::mem::take(&mut instance.restarts);
                let current_role = instance.role;
                *instance = fresh.into_instance(ordinal, current_role);
                instance.restarts = restarts;

                if instance.is_leader() {
                    if let Err(e) = output::point_current(&self.mode_dir(&mode), &instance.output_path) {
                        warn!(mode, new_slot, error = %e, "Failed to repoint output link");
                    }
                }
                info!(mode, ordinal, old_slot = ?old_slot, new_slot, role = ?role, "Instance restarted");
                Ok(new_slot)
            }
            (idx, Ok(fresh)) => {
                // The fleet was stopped or reset while the replacement started.
                if let Some(idx) = idx {
                    guard.instances[idx].relaunching = false;
                }
                stop_process(Some(fresh.slot_id), Some(fresh.pid));
                self.pool
                    .release(&fresh.lease_token, ReleaseReason::Shutdown)
                    .await?;
                Err(FleetError::NotRunning { mode })
            }
            (Some(idx), Err(e)) => {
                guard.instances[idx].relaunching = false;
                Err(e)
            }
            (None, Err(e)) => Err(e),
        };

        guard.refresh_state();
        entry.publish(&guard);
        result
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// One health pass over `mode`: reclaim stale leases, refresh cached
    /// health, fail over a lost Leader, and replace dead instances.
    ///
    /// The fleet lock is held only while results are applied; probes and
    /// replacement launches run without it.
    pub async fn sweep(&self, mode: &str) -> Result<ModeSweep, FleetError> {
        let entry = self.fleet(mode).await?;
        let mut sweep = ModeSweep {
            mode: mode.to_string(),
            ..ModeSweep::default()
        };
        if !entry.fleet.read().await.state.is_active() {
            return Ok(sweep);
        }

        let started = Instant::now();
        let policy = *self.pool.policy();
        let report = self
            .pool
            .reap_stale(mode, unix_timestamp(), policy.lease_ttl, policy.heartbeat_timeout)
            .await?;
        sweep.reclaimed = report.count();

        let relaunches = {
            let mut guard = entry.fleet.write().await;
            if !guard.state.is_active() {
                return Ok(sweep);
            }

            let leader_lost = self.apply_report(&mut guard, &report, started);
            entry.fold_demotions(&mut guard, Some(started));

            if let Some(reason) = leader_lost {
                match self.promote(&mut guard, reason).await {
                    Ok(slot) => sweep.promoted = Some(slot),
                    Err(FleetError::NoHealthyWorker { .. }) => {
                        warn!(mode, "No healthy worker to promote, restarting leader in place");
                    }
                    Err(e) => sweep.failures.push(e.to_string()),
                }
            }

            let dead: Vec<usize> = guard
                .instances
                .iter()
                .enumerate()
                .filter(|(_, i)| i.health == Health::Dead && !i.held && !i.relaunching)
                .map(|(idx, _)| idx)
                .collect();

            let mut relaunches = Vec::new();
            for idx in dead {
                let ordinal = guard.instances[idx].ordinal;
                match self.prepare_restart(&mut guard, idx).await {
                    Ok(relaunch) => relaunches.push(relaunch),
                    Err(e) => {
                        warn!(mode, ordinal, error = %e, "Replacement not started");
                        sweep.failures.push(format!("instance {ordinal}: {e}"));
                    }
                }
            }

            guard.refresh_state();
            entry.publish(&guard);
            relaunches
        };

        for relaunch in relaunches {
            let ordinal = relaunch.ordinal;
            match self.relaunch(&entry, relaunch).await {
                Ok(new_slot) => sweep.restarted.push(new_slot),
                Err(e) => {
                    warn!(mode, ordinal, error = %e, "Replacement failed");
                    sweep.failures.push(format!("instance {ordinal}: {e}"));
                }
            }
        }

        debug!(mode, reclaimed = sweep.reclaimed, restarted = sweep.restarted.len(), "Fleet swept");
        Ok(sweep)
    }

    /// Fold a reap report into cached health. Instances leased after the
    /// reap started are left alone. Returns the reason to fail over when
    /// the Leader's lease is gone.
    fn apply_report(
        &self,
        fleet: &mut Fleet,
        report: &ReapReport,
        started: Instant,
    ) -> Option<&'static str> {
        let stale_after = i64::try_from(self.settings.heartbeat_timeout.as_secs() / 2).unwrap_or(i64::MAX);
        let mut leader_lost = None;

        for instance in fleet
            .instances
            .iter_mut()
            .filter(|i| !i.held && i.health != Health::Dead && i.leased_at < started)
        {
            let lost = if let Some(reclaimed) = report
                .reclaimed
                .iter()
                .find(|r| r.lease_token == instance.lease_token)
            {
                Some(reclaimed.reason.as_str())
            } else {
                match report
                    .observed
                    .iter()
                    .find(|o| o.lease_token == instance.lease_token)
                {
                    Some(observation) => {
                        instance.health = if observation.heartbeat_age_secs > stale_after {
                            Health::Stale
                        } else {
                            Health::Healthy
                        };
                        None
                    }
                    None => Some(LEASE_LOST_REASON),
                }
            };

            if let Some(reason) = lost {
                warn!(mode = %fleet.mode, slot_id = ?instance.slot_id, reason, "Instance lost its lease");
                instance.health = Health::Dead;
                instance.pid = None;
                if instance.is_leader() {
                    leader_lost = Some(reason);
                }
            }
        }

        leader_lost
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn status(&self, mode: &str) -> Result<FleetSnapshot, FleetError> {
        let entry = self.fleet(mode).await?;
        let guard = entry.fleet.read().await;
        Ok(entry.snapshot(&guard))
    }

    /// Output link of `mode`.
    pub fn output_link(&self, mode: &str) -> PathBuf {
        output::link_path(&self.mode_dir(mode))
    }

    /// Where the output link currently points.
    pub fn output_target(&self, mode: &str) -> Option<PathBuf> {
        output::current_target(&self.mode_dir(mode))
    }
}
