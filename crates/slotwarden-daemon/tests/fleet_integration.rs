#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end fleet supervision with real engine processes.
//!
//! The engine is a shell loop that writes a heartbeat into its output
//! directory every second unless a `freeze` file is present there.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slotwarden_core::config::ModeConfig;
use slotwarden_core::db::unix_timestamp;
use slotwarden_daemon::control::ControlPlane;
use slotwarden_daemon::fleet::{
    FleetManager, FleetSettings, FleetState, Health, HealthMonitor, Role,
};
use slotwarden_daemon::process::{CommandLauncher, ProcessHandle};
use slotwarden_daemon::slots::{ReapPolicy, SlotPool};
use slotwarden_daemon::storage::Database;

const ENGINE: &str = r#"while :; do [ -e freeze ] || date +%s > "$SLOTWARDEN_HEARTBEAT_FILE"; sleep 1; done"#;

struct Supervisor {
    manager: Arc<FleetManager>,
    monitor: HealthMonitor,
    _dir: tempfile::TempDir,
}

async fn supervisor(fleet_size: u32) -> Supervisor {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("slots.db")).await.unwrap();
    let policy = ReapPolicy {
        lease_ttl: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(15),
        probe_timeout: Duration::from_millis(500),
    };
    let pool = SlotPool::new(db, policy);
    let launcher = Arc::new(CommandLauncher::new("sh").with_args(["-c", ENGINE, "engine"]));
    let settings = FleetSettings {
        run_dir: dir.path().join("run"),
        restart_ceiling: 3,
        restart_window: Duration::from_secs(300),
        heartbeat_timeout: policy.heartbeat_timeout,
    };
    let modes = BTreeMap::from([(
        "paper".to_string(),
        ModeConfig {
            base: 1,
            pool_size: 8,
            fleet_size,
        },
    )]);
    let manager = Arc::new(FleetManager::new(pool, launcher, settings, modes));
    manager.start("paper", fleet_size).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&manager), Duration::from_secs(2));
    Supervisor {
        manager,
        monitor,
        _dir: dir,
    }
}

async fn kill_and_wait(pid: u32) {
    let handle = ProcessHandle::new(pid, PathBuf::new());
    handle.terminate().unwrap();
    for _ in 0..100 {
        if !handle.is_alive() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("process {pid} did not exit");
}

fn instance_dir(manager: &FleetManager, ordinal: u32) -> PathBuf {
    manager.mode_dir("paper").join(format!("instance-{ordinal}"))
}

#[tokio::test]
async fn leader_death_promotes_a_worker_and_moves_output() {
    let sup = supervisor(4).await;
    let before = sup.manager.status("paper").await.unwrap();
    assert_eq!(before.state, FleetState::Running);
    assert_eq!(before.leader_slot, Some(1));
    assert_eq!(
        sup.manager.output_target("paper"),
        Some(instance_dir(&sup.manager, 0))
    );

    kill_and_wait(before.instances[0].pid.unwrap()).await;

    let report = sup.monitor.sweep_once().await;
    assert_eq!(report.reclaimed(), 1);
    assert_eq!(report.promotions(), 1);
    assert_eq!(report.restarts(), 1);

    let after = sup.manager.status("paper").await.unwrap();
    assert_eq!(after.state, FleetState::Running);
    assert_eq!(after.leader_slot, Some(2), "lowest healthy worker takes over");
    assert_eq!(
        after.instances.iter().filter(|i| i.role == Role::Leader).count(),
        1
    );
    assert_eq!(
        sup.manager.output_target("paper"),
        Some(instance_dir(&sup.manager, 1))
    );
    assert_eq!(after.leader_output, Some(instance_dir(&sup.manager, 1)));

    // The old leader's ordinal comes back as a worker on the freed slot.
    let replaced = after.instances.iter().find(|i| i.ordinal == 0).unwrap();
    assert_eq!(replaced.role, Role::Worker);
    assert_eq!(replaced.slot_id, Some(1));
    assert_ne!(replaced.pid, before.instances[0].pid);

    let events = sup.manager.leader_events("paper", 1).await.unwrap();
    assert_eq!(events[0].old_slot_id, Some(1));
    assert_eq!(events[0].new_slot_id, 2);
    assert_eq!(events[0].reason, "process_exited");

    sup.manager.shutdown().await;
}

#[tokio::test]
async fn frozen_leader_is_stopped_and_replaced() {
    let sup = supervisor(3).await;
    let before = sup.manager.status("paper").await.unwrap();
    let leader_dir = instance_dir(&sup.manager, 0);
    let leader_pid = before.instances[0].pid.unwrap();

    std::fs::write(leader_dir.join("freeze"), b"").unwrap();
    std::fs::write(
        leader_dir.join("heartbeat"),
        (unix_timestamp() - 100).to_string(),
    )
    .unwrap();

    let report = sup.monitor.sweep_once().await;
    assert_eq!(report.reclaimed(), 1);
    assert_eq!(report.promotions(), 1);

    // The stuck process was asked to stop.
    let handle = ProcessHandle::new(leader_pid, PathBuf::new());
    for _ in 0..100 {
        if !handle.is_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!handle.is_alive());

    let events = sup.manager.leader_events("paper", 1).await.unwrap();
    assert_eq!(events[0].reason, "heartbeat_stale");
    assert_eq!(sup.manager.status("paper").await.unwrap().leader_slot, Some(2));

    std::fs::remove_file(leader_dir.join("freeze")).unwrap();
    sup.manager.shutdown().await;
}

#[tokio::test]
async fn lone_leader_is_restarted_in_place() {
    let sup = supervisor(1).await;
    let before = sup.manager.status("paper").await.unwrap();
    kill_and_wait(before.instances[0].pid.unwrap()).await;

    let report = sup.monitor.sweep_once().await;
    assert_eq!(report.promotions(), 0);
    assert_eq!(report.restarts(), 1);

    let after = sup.manager.status("paper").await.unwrap();
    assert_eq!(after.leader_slot, Some(1));
    assert_eq!(after.instances[0].role, Role::Leader);
    assert_eq!(after.instances[0].health, Health::Healthy);
    assert_eq!(after.state, FleetState::Running);

    sup.manager.shutdown().await;
}

#[tokio::test]
async fn supervisor_restart_adopts_running_fleet() {
    let sup = supervisor(2).await;
    let before = sup.manager.status("paper").await.unwrap();

    // A new supervisor over the same database and run directory, as after
    // a crash of the previous one.
    let successor = FleetManager::new(
        sup.manager.pool().clone(),
        Arc::new(CommandLauncher::new("sh").with_args(["-c", ENGINE, "engine"])),
        sup.manager.settings().clone(),
        BTreeMap::from([(
            "paper".to_string(),
            ModeConfig {
                base: 1,
                pool_size: 8,
                fleet_size: 2,
            },
        )]),
    );
    let after = successor.start("paper", 2).await.unwrap();

    assert_eq!(after.leader_slot, before.leader_slot);
    let pids = |instances: &[slotwarden_daemon::fleet::InstanceSnapshot]| {
        instances.iter().map(|i| i.pid).collect::<Vec<_>>()
    };
    assert_eq!(pids(&after.instances), pids(&before.instances));

    successor.shutdown().await;
}

#[tokio::test]
async fn operator_reset_releases_and_restarts() {
    let sup = supervisor(3).await;
    let control = ControlPlane::new(Arc::clone(&sup.manager));
    control.promote("paper").await.unwrap();
    assert_eq!(control.status("paper").await.unwrap().leader_slot, Some(2));

    let challenge = control.request_reset("paper").await.unwrap();
    let snapshot = control.reset("paper", &challenge.token).await.unwrap();
    assert_eq!(snapshot.state, FleetState::Running);
    assert_eq!(snapshot.leader_slot, Some(1));
    assert!(
        snapshot
            .instances
            .iter()
            .all(|i| i.health == Health::Healthy)
    );

    let released = sup
        .manager
        .pool()
        .slots("paper")
        .await
        .unwrap()
        .into_iter()
        .filter(|s| !s.is_leased())
        .count();
    assert_eq!(released, 5);

    sup.manager.shutdown().await;
}

