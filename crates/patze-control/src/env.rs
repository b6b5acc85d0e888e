//! Process configuration from the environment.

use patze_fleet::FleetEngineConfig;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9700;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: String,
    pub port: u16,
    /// Anchor for `~`-relative safety checks; the process home in
    /// production, a tempdir in tests.
    pub home: PathBuf,
    pub settings_dir: PathBuf,
    pub cron_store_dir: PathBuf,
    pub openclaw_home: PathBuf,
    pub heartbeat_timeout_ms: u64,
    pub cron_sync_rate_limit_max: u32,
    pub fleet: FleetEngineConfig,
}

impl EnvConfig {
    /// Read configuration from the environment, falling back to the
    /// documented defaults. Unparseable values fall back rather than abort.
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let settings_dir = var_path("PATZE_SETTINGS_DIR")
            .unwrap_or_else(|| home.join(".patze-control"));
        let cron_store_dir =
            var_path("CRON_STORE_DIR").unwrap_or_else(|| settings_dir.join("cron-store"));
        let openclaw_home = var_path("OPENCLAW_HOME").unwrap_or_else(|| home.join(".openclaw"));

        let fleet_defaults = FleetEngineConfig::default();
        let heartbeat_timeout_ms = var_u64("HEARTBEAT_TIMEOUT_MS")
            .unwrap_or(fleet_defaults.heartbeat_timeout_ms);
        let fleet = FleetEngineConfig {
            enabled: var_bool("SMART_FLEET_V2_ENABLED").unwrap_or(fleet_defaults.enabled),
            max_sync_lag_ms: var_u64("SMART_FLEET_MAX_SYNC_LAG_MS")
                .unwrap_or(fleet_defaults.max_sync_lag_ms),
            min_bridge_version: std::env::var("SMART_FLEET_MIN_BRIDGE_VERSION")
                .ok()
                .filter(|v| !v.is_empty()),
            alert_cooldown_ms: var_u64("SMART_FLEET_ALERT_COOLDOWN_MS")
                .unwrap_or(fleet_defaults.alert_cooldown_ms),
            approval_critical_threshold: var_u64("SMART_FLEET_APPROVAL_CRITICAL_THRESHOLD")
                .map(|v| v as usize)
                .unwrap_or(fleet_defaults.approval_critical_threshold),
            approval_ttl_ms: var_u64("SMART_FLEET_APPROVAL_TTL_MS")
                .unwrap_or(fleet_defaults.approval_ttl_ms),
            heartbeat_timeout_ms,
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: var_u64("PORT").map(|p| p as u16).unwrap_or(DEFAULT_PORT),
            home,
            settings_dir,
            cron_store_dir,
            openclaw_home,
            heartbeat_timeout_ms,
            cron_sync_rate_limit_max: var_u64("BRIDGE_CRON_SYNC_RATE_LIMIT_MAX")
                .map(|v| v as u32)
                .unwrap_or(60),
            fleet,
        }
    }
}

fn var_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn var_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn var_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}
