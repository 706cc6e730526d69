//! Configuration resolution for slotwarden.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/slotwarden/settings.json)
//! 3. Project config (.slotwarden/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete slotwarden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default = "default_modes")]
    pub modes: BTreeMap<String, ModeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            restart: RestartConfig::default(),
            modes: default_modes(),
        }
    }
}

/// Supervisor process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub database_path: Option<PathBuf>,
    /// Directory holding per-mode output directories and leader links.
    pub run_dir: Option<PathBuf>,
    /// Execution engine binary launched once per slot.
    pub engine_bin: PathBuf,
    /// Extra arguments passed before the slot arguments.
    pub engine_args: Vec<String>,
    pub log_level: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            run_dir: None,
            engine_bin: PathBuf::from("execution-engine"),
            engine_args: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

/// Health sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub sweep_interval_secs: u64,
    /// A heartbeat older than this marks the holder stuck.
    pub heartbeat_timeout_secs: u64,
    /// Leases with no process attached expire after this long.
    pub lease_ttl_secs: u64,
    /// Upper bound on a single heartbeat read.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 2,
            heartbeat_timeout_secs: 15,
            lease_ttl_secs: 60,
            probe_timeout_ms: 500,
        }
    }
}

impl HealthConfig {
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Restart ceiling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Restarts allowed per instance inside one window.
    pub ceiling: u32,
    pub window_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            ceiling: 3,
            window_secs: 300,
        }
    }
}

impl RestartConfig {
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-mode pool and fleet sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// First slot identifier of the mode's range.
    pub base: i64,
    /// Number of slot identifiers reserved for the mode.
    pub pool_size: u32,
    /// Number of supervised processes to run.
    pub fleet_size: u32,
}

impl ModeConfig {
    /// Last slot identifier of the range (inclusive).
    pub const fn last_slot(&self) -> i64 {
        self.base + self.pool_size as i64 - 1
    }

    const fn overlaps(&self, other: &Self) -> bool {
        self.base <= other.last_slot() && other.base <= self.last_slot()
    }
}

fn default_modes() -> BTreeMap<String, ModeConfig> {
    BTreeMap::from([
        (
            "paper".to_string(),
            ModeConfig {
                base: 1,
                pool_size: 8,
                fleet_size: 4,
            },
        ),
        (
            "live".to_string(),
            ModeConfig {
                base: 101,
                pool_size: 8,
                fleet_size: 4,
            },
        ),
    ])
}

impl Config {
    /// Check sizing constraints that the pool relies on.
    pub fn validate(&self) -> Result<()> {
        if self.restart.ceiling == 0 {
            return Err(Error::Config("restart.ceiling must be at least 1".into()));
        }
        if self.health.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "health.sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.health.heartbeat_timeout_secs == 0 {
            return Err(Error::Config(
                "health.heartbeat_timeout_secs must be at least 1".into(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "health.probe_timeout_ms must be at least 1".into(),
            ));
        }
        for (name, mode) in &self.modes {
            if mode.pool_size == 0 {
                return Err(Error::Config(format!("mode {name}: pool_size must be > 0")));
            }
            if mode.fleet_size > mode.pool_size {
                return Err(Error::Config(format!(
                    "mode {name}: fleet_size {} exceeds pool_size {}",
                    mode.fleet_size, mode.pool_size
                )));
            }
            if mode.base < 0 {
                return Err(Error::Config(format!("mode {name}: base must be >= 0")));
            }
        }
        let modes: Vec<_> = self.modes.iter().collect();
        for (i, (a_name, a)) in modes.iter().enumerate() {
            for (b_name, b) in &modes[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::Config(format!(
                        "slot ranges of modes {a_name} and {b_name} overlap"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global)?;
        }
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".slotwarden").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project)?;
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("slotwarden").join("settings.json"))
}

/// Get the default database path for the supervisor.
pub fn database_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("slotwarden").join("slots.db"))
}

fn config_home() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply one config layer. Only keys present in `overlay` change; nested
/// objects (sections, individual modes) merge key by key.
fn merge_config(base: &mut Config, overlay: Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_values(&mut merged, overlay);
    *base = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    Ok(())
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SLOTWARDEN_ENGINE_BIN") {
        config.supervisor.engine_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("SLOTWARDEN_RUN_DIR") {
        config.supervisor.run_dir = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("SLOTWARDEN_LOG_LEVEL") {
        config.supervisor.log_level = val;
    }
    if let Ok(val) = std::env::var("SLOTWARDEN_SWEEP_INTERVAL_SECS") {
        if let Ok(n) = val.parse() {
            config.health.sweep_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("SLOTWARDEN_HEARTBEAT_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.health.heartbeat_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("SLOTWARDEN_RESTART_CEILING") {
        if let Ok(n) = val.parse() {
            config.restart.ceiling = n;
        }
    }
}
