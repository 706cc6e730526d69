//! slotwarden daemon
//!
//! Leases connection slots to a fleet of execution-engine processes per
//! trading mode and keeps each fleet's Leader alive.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use slotwarden_core::config::{self, Config};
use slotwarden_daemon::fleet::{FleetManager, FleetSettings, HealthMonitor};
use slotwarden_daemon::process::CommandLauncher;
use slotwarden_daemon::slots::{ReapPolicy, SlotPool};
use slotwarden_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "slotwarden-daemon")]
#[command(version, about = "slotwarden daemon - execution-engine fleet supervisor")]
struct Args {
    /// Project directory searched for `.slotwarden/settings.json`
    #[arg(long, env = "SLOTWARDEN_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "SLOTWARDEN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory for per-instance output and the leader output link
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Execution engine binary
    #[arg(long)]
    engine_bin: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SLOTWARDEN_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "SLOTWARDEN_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = config::load_config(Some(project_dir.as_path()))?;
    apply_args(&mut config, &args);
    config.validate()?;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("slotwarden_daemon={}", config.supervisor.log_level);
    let _metrics_guard = slotwarden_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        modes = config.modes.len(),
        engine = %config.supervisor.engine_bin.display(),
        "Starting slotwarden-daemon"
    );

    let db_path = match &config.supervisor.database_path {
        Some(path) => path.clone(),
        None => config::database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine database location"))?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let run_dir = match &config.supervisor.run_dir {
        Some(dir) => dir.clone(),
        None => default_run_dir()?,
    };
    info!(path = %run_dir.display(), "Using run directory");

    let pool = SlotPool::new(db, ReapPolicy::from(&config.health));
    let launcher = Arc::new(
        CommandLauncher::new(&config.supervisor.engine_bin)
            .with_args(config.supervisor.engine_args.clone()),
    );
    let manager = Arc::new(FleetManager::new(
        pool,
        launcher,
        FleetSettings::from_config(&config, run_dir),
        config.modes.clone(),
    ));

    for (mode, mode_config) in &config.modes {
        if mode_config.fleet_size == 0 {
            info!(mode, "Fleet size is zero, not starting");
            continue;
        }
        match manager.start(mode, mode_config.fleet_size).await {
            Ok(snapshot) => info!(
                mode,
                state = ?snapshot.state,
                leader_slot = ?snapshot.leader_slot,
                instances = snapshot.instances.len(),
                "Fleet running"
            ),
            Err(e) => error!(mode, error = %e, "Failed to start fleet"),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_handle =
        HealthMonitor::new(Arc::clone(&manager), config.health.sweep_interval()).spawn(shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the supervisor is ready (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so engine processes
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Health monitor task failed");
    }
    manager.shutdown().await;

    info!("Daemon stopped");
    Ok(())
}

/// CLI flags take precedence over every configuration layer.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(path) = &args.db_path {
        config.supervisor.database_path = Some(path.clone());
    }
    if let Some(dir) = &args.run_dir {
        config.supervisor.run_dir = Some(dir.clone());
    }
    if let Some(bin) = &args.engine_bin {
        config.supervisor.engine_bin.clone_from(bin);
    }
    if let Some(level) = &args.log_level {
        config.supervisor.log_level.clone_from(level);
    }
}

/// Default run directory: <local data dir>/slotwarden/run
fn default_run_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine local data directory"))?;
    Ok(base.join("slotwarden").join("run"))
}
