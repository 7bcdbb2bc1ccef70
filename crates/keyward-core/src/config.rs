//! Configuration resolution for Keyward.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/keyward/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::MS_PER_DAY;
use crate::error::{Error, Result};

/// Complete Keyward configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Maintenance loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Days past expiry before a key is deleted.
    pub grace_period_days: u32,
    /// Local/remote expiry difference treated as "no change needed".
    pub drift_tolerance_ms: i64,
    /// Remaining-time warning thresholds, in hours.
    pub notification_thresholds_hours: Vec<u32>,
    pub probe_interval_secs: u64,
    pub telemetry_interval_secs: u64,
    /// Sleep between the end of one cycle and the start of the next.
    pub cycle_period_secs: u64,
    /// Delay before the first cycle.
    pub initial_delay_secs: u64,
    /// Per-command ceiling for SSH probes and telemetry.
    pub ssh_command_timeout_secs: u64,
    /// Ceiling for one whole gated job run.
    pub job_timeout_secs: u64,
    pub log_level: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 5,
            drift_tolerance_ms: 1000,
            notification_thresholds_hours: vec![72, 48, 24, 1],
            probe_interval_secs: 6 * 60 * 60,
            telemetry_interval_secs: 5 * 60,
            cycle_period_secs: 60,
            initial_delay_secs: 15,
            ssh_command_timeout_secs: 60,
            job_timeout_secs: 10 * 60,
            log_level: "info".to_string(),
        }
    }
}

impl MaintenanceConfig {
    pub fn grace_period_ms(&self) -> i64 {
        i64::from(self.grace_period_days) * MS_PER_DAY
    }

    pub const fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub const fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub const fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_period_secs)
    }

    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub const fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_secs)
    }

    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Remote panel HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Accept self-signed panel certificates.
    pub accept_invalid_certs: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl PanelConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Telegram Bot API configuration for notifications and snapshot delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_base: String,
    /// Recipients of snapshot deliveries.
    pub admin_ids: Vec<i64>,
    pub connect_timeout_secs: u64,
    /// Ceiling for one Bot API call, including document uploads.
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            admin_ids: Vec::new(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl TelegramConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Snapshot job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Used when the live `snapshot_interval_days` setting is absent.
    pub default_interval_days: u32,
    /// Number of snapshot files kept on disk.
    pub retention: usize,
    pub directory: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            default_interval_days: 1,
            retention: 7,
            directory: None,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    validate(&config)?;

    Ok(config)
}

/// Get the global config path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("keyward.db"))
}

/// Get the default snapshot directory.
pub fn snapshot_dir() -> Option<PathBuf> {
    config_dir().map(|p| p.join("snapshots"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".keyward"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/keyward"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("keyward"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.maintenance = overlay.maintenance;
    base.panel = overlay.panel;
    if overlay.telegram.bot_token.is_some() {
        base.telegram.bot_token = overlay.telegram.bot_token;
    }
    base.telegram.api_base = overlay.telegram.api_base;
    if !overlay.telegram.admin_ids.is_empty() {
        base.telegram.admin_ids = overlay.telegram.admin_ids;
    }
    base.telegram.connect_timeout_secs = overlay.telegram.connect_timeout_secs;
    base.telegram.request_timeout_secs = overlay.telegram.request_timeout_secs;
    if overlay.snapshot.directory.is_some() {
        base.snapshot.directory = overlay.snapshot.directory;
    }
    base.snapshot.default_interval_days = overlay.snapshot.default_interval_days;
    base.snapshot.retention = overlay.snapshot.retention;
    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("KEYWARD_GRACE_PERIOD_DAYS").and_then(|v| v.parse().ok()) {
        config.maintenance.grace_period_days = n;
    }
    if let Some(n) = var("KEYWARD_DRIFT_TOLERANCE_MS").and_then(|v| v.parse().ok()) {
        config.maintenance.drift_tolerance_ms = n;
    }
    if let Some(val) = var("KEYWARD_NOTIFICATION_THRESHOLDS") {
        let parsed: std::result::Result<Vec<u32>, _> =
            val.split(',').map(|s| s.trim().parse()).collect();
        if let Ok(list) = parsed {
            config.maintenance.notification_thresholds_hours = list;
        }
    }
    if let Some(n) = var("KEYWARD_CYCLE_PERIOD_SECS").and_then(|v| v.parse().ok()) {
        config.maintenance.cycle_period_secs = n;
    }
    if let Some(val) = var("KEYWARD_LOG_LEVEL") {
        config.maintenance.log_level = val;
    }
    if let Some(val) = var("KEYWARD_BOT_TOKEN") {
        config.telegram.bot_token = Some(val);
    }
}

fn validate(config: &Config) -> Result<()> {
    let m = &config.maintenance;
    if m.drift_tolerance_ms < 0 {
        return Err(Error::Config("drift_tolerance_ms must not be negative".into()));
    }
    let durations = [
        ("maintenance.cycle_period_secs", m.cycle_period_secs),
        ("maintenance.probe_interval_secs", m.probe_interval_secs),
        ("maintenance.telemetry_interval_secs", m.telemetry_interval_secs),
        ("maintenance.job_timeout_secs", m.job_timeout_secs),
        ("maintenance.ssh_command_timeout_secs", m.ssh_command_timeout_secs),
        ("panel.connect_timeout_secs", config.panel.connect_timeout_secs),
        ("panel.request_timeout_secs", config.panel.request_timeout_secs),
        ("telegram.connect_timeout_secs", config.telegram.connect_timeout_secs),
        ("telegram.request_timeout_secs", config.telegram.request_timeout_secs),
    ];
    if let Some((name, _)) = durations.into_iter().find(|(_, secs)| *secs == 0) {
        return Err(Error::Config(format!("{name} must be positive")));
    }
    if m.notification_thresholds_hours.contains(&0) {
        return Err(Error::Config(
            "notification thresholds must be at least one hour".into(),
        ));
    }
    Ok(())
}
