//! Shared fixtures for the integration tests.

use patze_control::{AppState, AuthConfig, EnvConfig, SharedState};
use patze_fleet::FleetEngineConfig;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A disposable control-plane universe rooted in a tempdir: home,
/// settings, cron store, and an allowed OpenClaw dir.
pub struct TestWorld {
    pub tmp: TempDir,
    pub home: PathBuf,
    pub openclaw_dir: PathBuf,
    pub config: EnvConfig,
}

impl TestWorld {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let home = tmp.path().join("home");
        let openclaw_dir = home.join(".openclaw");
        std::fs::create_dir_all(&openclaw_dir).expect("mkdir");

        let settings_dir = home.join(".patze-control");
        let config = EnvConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            home: home.clone(),
            settings_dir: settings_dir.clone(),
            cron_store_dir: settings_dir.join("cron-store"),
            openclaw_home: openclaw_dir.clone(),
            heartbeat_timeout_ms: 120_000,
            cron_sync_rate_limit_max: 60,
            fleet: FleetEngineConfig::default(),
        };

        Self {
            tmp,
            home,
            openclaw_dir,
            config,
        }
    }

    pub fn state(&self) -> SharedState {
        AppState::build(self.config.clone(), AuthConfig::open()).expect("state")
    }

    pub fn state_with_token(&self, token: &str) -> SharedState {
        let auth = AuthConfig {
            mode: patze_control::auth::AuthFileMode::Token,
            token: Some(token.to_string()),
        };
        AppState::build(self.config.clone(), auth).expect("state")
    }

    /// Seed `openclaw.json` in the default OpenClaw dir.
    pub fn write_config(&self, contents: &str) {
        std::fs::write(self.openclaw_dir.join("openclaw.json"), contents).expect("write config");
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw telemetry event body as bridges post them.
pub fn telemetry_event(id: &str, ts: &str, machine: &str, kind: &str, payload: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "version": "telemetry.v1",
        "id": id,
        "ts": ts,
        "machineId": machine,
        "severity": "info",
        "type": kind,
        "payload": payload,
    })
}

/// Register a target inside the world's allowed directory tree.
pub fn target_in(dir: &Path) -> patze_sync::NewTarget {
    patze_sync::NewTarget {
        label: "fixture".to_string(),
        target_type: patze_proto::TargetType::Local,
        origin: patze_proto::TargetOrigin::User,
        purpose: patze_proto::TargetPurpose::Production,
        openclaw_dir: dir.to_string_lossy().into_owned(),
        poll_interval_ms: Some(1_000),
    }
}
