//! The per-bridge install state machine.

use crate::{BridgeSession, BridgeTransport, Diagnosis, PreflightFailureKind, PreflightReport};
use crate::ssh::content_sha256;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Whole-install wall clock budget.
pub const INSTALL_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// How long to wait for the installed bridge to show up in telemetry.
const TELEMETRY_WINDOW: Duration = Duration::from_secs(45);
const TELEMETRY_POLL: Duration = Duration::from_secs(3);
const LOG_RING_CAP: usize = 500;

// ─── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupInput {
    pub label: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
    /// Bridge-managed hosts may trust-on-first-use; mismatches still fail.
    #[serde(default)]
    pub trust_on_first_use: bool,
    /// Remote directory the bridge lives in.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    /// Installer bundle bytes (tarball with install.sh inside).
    #[serde(skip)]
    pub bundle: Vec<u8>,
    /// Bridge config file contents.
    #[serde(skip)]
    pub config: Vec<u8>,
}

fn default_remote_dir() -> String {
    "/opt/openclaw-bridge".to_string()
}

impl SetupInput {
    fn bundle_path(&self) -> String {
        format!("{}/bridge-bundle.tar.gz", self.remote_dir)
    }

    fn config_path(&self) -> String {
        format!("{}/bridge.json", self.remote_dir)
    }

    /// The raw unpack-and-install chain, without privilege wrapping.
    fn install_script(&self, user_mode: bool) -> String {
        let flag = if user_mode { " --user-mode" } else { "" };
        format!(
            "tar -xzf {bundle} -C {dir} && {dir}/install.sh{flag}",
            bundle = self.bundle_path(),
            dir = self.remote_dir
        )
    }

    fn installer(&self, user_mode: bool) -> String {
        let script = self.install_script(user_mode);
        if user_mode {
            script
        } else {
            format!("sudo -n sh -c '{script}'")
        }
    }
}

// ─── Bridge state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Installing,
    NeedsSudoPassword,
    TunnelOpen,
    TelemetryActive,
    Running,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeView {
    pub id: String,
    pub label: String,
    pub host: String,
    pub state: BridgeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub log: Vec<String>,
}

struct ManagedBridge {
    input: SetupInput,
    state: BridgeState,
    error: Option<Diagnosis>,
    machine_id: Option<String>,
    note: Option<String>,
    bundle_hash: Option<String>,
    config_hash: Option<String>,
    updated_at: DateTime<Utc>,
    log: VecDeque<String>,
}

impl ManagedBridge {
    fn push_log(&mut self, line: impl Into<String>) {
        if self.log.len() == LOG_RING_CAP {
            self.log.pop_front();
        }
        self.log.push_back(format!("{} {}", Utc::now().to_rfc3339(), line.into()));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagedBridgeError {
    #[error("bridge '{0}' not found")]
    NotFound(String),
    #[error("bridge '{0}' is not waiting for a sudo password")]
    NotAwaitingPassword(String),
}

// ─── Telemetry probe seam ─────────────────────────────────────────────────────

/// Asks the telemetry side whether a machine with the given label has
/// checked in. The control surface implements this against the aggregator.
#[async_trait::async_trait]
pub trait TelemetryProbe: Send + Sync {
    async fn find_machine(&self, label: &str) -> Option<String>;
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct BridgeSetupManager {
    transport: Arc<dyn BridgeTransport>,
    telemetry: Arc<dyn TelemetryProbe>,
    bridges: Mutex<HashMap<String, ManagedBridge>>,
}

impl BridgeSetupManager {
    pub fn new(transport: Arc<dyn BridgeTransport>, telemetry: Arc<dyn TelemetryProbe>) -> Self {
        Self {
            transport,
            telemetry,
            bridges: Mutex::new(HashMap::new()),
        }
    }

    /// Probe SSH reachability and auth without installing anything.
    pub async fn preflight(&self, input: &SetupInput) -> PreflightReport {
        let checked_at = Utc::now();
        let session = match self.transport.connect(input).await {
            Ok(session) => session,
            Err(diagnosis) => {
                return PreflightReport {
                    ok: false,
                    diagnosis: Some(diagnosis),
                    checked_at,
                };
            }
        };

        match session.exec("true").await {
            Ok(output) if output.success() => PreflightReport {
                ok: true,
                diagnosis: None,
                checked_at,
            },
            Ok(output) => PreflightReport {
                ok: false,
                diagnosis: Some(Diagnosis::new(
                    PreflightFailureKind::SshExecFailed,
                    format!("probe command exited {}", output.exit_code),
                )),
                checked_at,
            },
            Err(diagnosis) => PreflightReport {
                ok: false,
                diagnosis: Some(diagnosis),
                checked_at,
            },
        }
    }

    /// Install a bridge. Returns the bridge id immediately usable with
    /// [`Self::get`]; the final state is in the returned view.
    pub async fn setup(&self, input: SetupInput) -> BridgeView {
        let id = patze_proto::prefixed_id("brg");
        {
            let mut bridges = self.bridges.lock();
            let mut bridge = ManagedBridge {
                input: input.clone(),
                state: BridgeState::Installing,
                error: None,
                machine_id: None,
                note: None,
                bundle_hash: None,
                config_hash: None,
                updated_at: Utc::now(),
                log: VecDeque::new(),
            };
            bridge.push_log(format!("setup started for {}@{}", input.user, input.host));
            bridges.insert(id.clone(), bridge);
        }

        let outcome = tokio::time::timeout(INSTALL_DEADLINE, self.install(&id, false, None)).await;
        if outcome.is_err() {
            self.fail(
                &id,
                Diagnosis::new(PreflightFailureKind::SshTimeout, "install deadline exceeded"),
            );
        }
        self.view(&id).unwrap_or_else(|| unreachable_view(&id))
    }

    /// Resume an install that stopped at `needs_sudo_password`.
    pub async fn retry_install_with_sudo_password(
        &self,
        id: &str,
        password: &str,
    ) -> Result<BridgeView, ManagedBridgeError> {
        {
            let bridges = self.bridges.lock();
            let bridge = bridges
                .get(id)
                .ok_or_else(|| ManagedBridgeError::NotFound(id.to_string()))?;
            if bridge.state != BridgeState::NeedsSudoPassword {
                return Err(ManagedBridgeError::NotAwaitingPassword(id.to_string()));
            }
        }
        self.set_state(id, BridgeState::Installing, "retrying with sudo password");
        let outcome = tokio::time::timeout(
            INSTALL_DEADLINE,
            self.install(id, false, Some(password.to_string())),
        )
        .await;
        if outcome.is_err() {
            self.fail(
                id,
                Diagnosis::new(PreflightFailureKind::SshTimeout, "install deadline exceeded"),
            );
        }
        Ok(self.view(id).unwrap_or_else(|| unreachable_view(id)))
    }

    /// Force the user-mode install path.
    pub async fn retry_install_user_mode(&self, id: &str) -> Result<BridgeView, ManagedBridgeError> {
        if !self.bridges.lock().contains_key(id) {
            return Err(ManagedBridgeError::NotFound(id.to_string()));
        }
        self.set_state(id, BridgeState::Installing, "retrying in user mode");
        let outcome = tokio::time::timeout(INSTALL_DEADLINE, self.install(id, true, None)).await;
        if outcome.is_err() {
            self.fail(
                id,
                Diagnosis::new(PreflightFailureKind::SshTimeout, "install deadline exceeded"),
            );
        }
        Ok(self.view(id).unwrap_or_else(|| unreachable_view(id)))
    }

    pub fn get(&self, id: &str) -> Option<BridgeView> {
        self.view(id)
    }

    pub fn list(&self) -> Vec<BridgeView> {
        let bridges = self.bridges.lock();
        let mut out: Vec<BridgeView> = bridges.keys().filter_map(|id| view_locked(&bridges, id)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn mark_disconnected(&self, id: &str) {
        self.set_state(id, BridgeState::Disconnected, "tunnel reported disconnected");
    }

    // ─── Install pipeline ────────────────────────────────────────────────────

    async fn install(&self, id: &str, user_mode: bool, sudo_password: Option<String>) {
        let input = {
            let bridges = self.bridges.lock();
            let Some(bridge) = bridges.get(id) else { return };
            bridge.input.clone()
        };

        let session = match self.transport.connect(&input).await {
            Ok(session) => session,
            Err(diagnosis) => {
                self.fail(id, diagnosis);
                return;
            }
        };
        self.log(id, "ssh session established");

        let bundle_changed = match self
            .upload_if_changed(session.as_ref(), &input.bundle_path(), &input.bundle)
            .await
        {
            Ok(changed) => changed,
            Err(diagnosis) => {
                self.fail(id, diagnosis);
                return;
            }
        };
        let config_changed = match self
            .upload_if_changed(session.as_ref(), &input.config_path(), &input.config)
            .await
        {
            Ok(changed) => changed,
            Err(diagnosis) => {
                self.fail(id, diagnosis);
                return;
            }
        };
        self.log(
            id,
            format!("uploads done (bundle changed: {bundle_changed}, config changed: {config_changed})"),
        );

        // Restart is skipped when nothing changed and the service is live.
        if !bundle_changed && !config_changed {
            let probe = if user_mode {
                "systemctl --user is-active openclaw-bridge"
            } else {
                "systemctl is-active openclaw-bridge"
            };
            if let Ok(output) = session.exec(probe).await
                && output.success()
            {
                self.log(id, "binary and config unchanged, service active; restart skipped");
                self.finish_with_telemetry(id, &input).await;
                return;
            }
        }

        let install_cmd = match &sudo_password {
            Some(password) => format!(
                "printf '%s\\n' '{}' | sudo -S -p '' sh -c '{}'",
                password.replace('\'', "'\\''"),
                input.install_script(false)
            ),
            None => input.installer(user_mode),
        };

        let output = match session.exec(&install_cmd).await {
            Ok(output) => output,
            Err(diagnosis) => {
                self.fail(id, diagnosis);
                return;
            }
        };

        if !output.success() {
            if !user_mode && sudo_password.is_none() && output.needs_sudo_password() {
                self.set_state(id, BridgeState::NeedsSudoPassword, "sudo requires a password");
                return;
            }
            if sudo_password.is_some() {
                // Sudo still refused: fall back to the user-mode bundle.
                self.log(id, "sudo install failed; falling back to user mode");
                let fallback = match session.exec(&input.installer(true)).await {
                    Ok(output) => output,
                    Err(diagnosis) => {
                        self.fail(id, diagnosis);
                        return;
                    }
                };
                if !fallback.success() {
                    self.fail(
                        id,
                        Diagnosis::new(
                            PreflightFailureKind::SshExecFailed,
                            format!("user-mode installer exited {}", fallback.exit_code),
                        ),
                    );
                    return;
                }
            } else {
                self.fail(
                    id,
                    Diagnosis::new(
                        PreflightFailureKind::SshExecFailed,
                        format!("installer exited {}", output.exit_code),
                    ),
                );
                return;
            }
        }

        self.set_state(id, BridgeState::TunnelOpen, "installer finished");
        self.finish_with_telemetry(id, &input).await;
    }

    async fn upload_if_changed(
        &self,
        session: &dyn BridgeSession,
        remote_path: &str,
        bytes: &[u8],
    ) -> Result<bool, Diagnosis> {
        let local = content_sha256(bytes);
        let remote = session.remote_sha256(remote_path).await?;
        if remote.as_deref() == Some(local.as_str()) {
            return Ok(false);
        }
        session.upload(remote_path, bytes).await?;
        Ok(true)
    }

    /// Wait for the installed bridge to surface in telemetry; settle as
    /// `telemetry_active` or stay `running` with a note.
    async fn finish_with_telemetry(&self, id: &str, input: &SetupInput) {
        let deadline = tokio::time::Instant::now() + TELEMETRY_WINDOW;
        loop {
            if let Some(machine_id) = self.telemetry.find_machine(&input.label).await {
                let mut bridges = self.bridges.lock();
                if let Some(bridge) = bridges.get_mut(id) {
                    bridge.machine_id = Some(machine_id.clone());
                    bridge.state = BridgeState::TelemetryActive;
                    bridge.updated_at = Utc::now();
                    bridge.push_log(format!("telemetry active as machine {machine_id}"));
                }
                info!(bridge_id = %id, %machine_id, "bridge telemetry active");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(TELEMETRY_POLL).await;
        }

        let mut bridges = self.bridges.lock();
        if let Some(bridge) = bridges.get_mut(id) {
            bridge.state = BridgeState::Running;
            bridge.note = Some("installed; telemetry not yet observed".to_string());
            bridge.updated_at = Utc::now();
            bridge.push_log("telemetry window elapsed without a check-in");
        }
        warn!(bridge_id = %id, "bridge installed but telemetry never arrived");
    }

    // ─── Record helpers ──────────────────────────────────────────────────────

    fn fail(&self, id: &str, diagnosis: Diagnosis) {
        let mut bridges = self.bridges.lock();
        if let Some(bridge) = bridges.get_mut(id) {
            bridge.push_log(format!("failed: {} ({:?})", diagnosis.detail, diagnosis.kind));
            bridge.state = BridgeState::Error;
            bridge.error = Some(diagnosis);
            bridge.updated_at = Utc::now();
        }
    }

    fn set_state(&self, id: &str, state: BridgeState, log_line: &str) {
        let mut bridges = self.bridges.lock();
        if let Some(bridge) = bridges.get_mut(id) {
            bridge.state = state;
            bridge.updated_at = Utc::now();
            bridge.push_log(log_line);
        }
    }

    fn log(&self, id: &str, line: impl Into<String>) {
        let mut bridges = self.bridges.lock();
        if let Some(bridge) = bridges.get_mut(id) {
            bridge.push_log(line);
        }
    }

    fn view(&self, id: &str) -> Option<BridgeView> {
        view_locked(&self.bridges.lock(), id)
    }
}

fn view_locked(bridges: &HashMap<String, ManagedBridge>, id: &str) -> Option<BridgeView> {
    bridges.get(id).map(|bridge| BridgeView {
        id: id.to_string(),
        label: bridge.input.label.clone(),
        host: bridge.input.host.clone(),
        state: bridge.state,
        error: bridge.error.clone(),
        machine_id: bridge.machine_id.clone(),
        note: bridge.note.clone(),
        updated_at: bridge.updated_at,
        log: bridge.log.iter().cloned().collect(),
    })
}

fn unreachable_view(id: &str) -> BridgeView {
    BridgeView {
        id: id.to_string(),
        label: String::new(),
        host: String::new(),
        state: BridgeState::Error,
        error: None,
        machine_id: None,
        note: None,
        updated_at: Utc::now(),
        log: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BridgeSession, BridgeTransport, ExecOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;

    /// Scripted fake: upload targets, exec responses, remote hashes.
    #[derive(Default)]
    struct FakeRemote {
        files: PlMutex<HashMap<String, Vec<u8>>>,
        exec_log: PlMutex<Vec<String>>,
        sudo_needs_password: bool,
        sudo_always_fails: bool,
        installer_fails: bool,
        service_active: bool,
    }

    struct FakeSession(Arc<FakeRemote>);

    #[async_trait]
    impl BridgeSession for FakeSession {
        async fn exec(&self, command: &str) -> Result<ExecOutput, Diagnosis> {
            self.0.exec_log.lock().push(command.to_string());

            if command.contains("is-active") {
                return Ok(ExecOutput {
                    exit_code: if self.0.service_active { 0 } else { 3 },
                    ..Default::default()
                });
            }
            if command.starts_with("sudo -n") && self.0.sudo_needs_password {
                return Ok(ExecOutput {
                    exit_code: 1,
                    stderr: "sudo: a password is required".to_string(),
                    ..Default::default()
                });
            }
            if command.contains("sudo -S") && self.0.sudo_always_fails {
                return Ok(ExecOutput {
                    exit_code: 1,
                    stderr: "sudo: incorrect password attempt".to_string(),
                    ..Default::default()
                });
            }
            if command.contains("install.sh") && self.0.installer_fails {
                return Ok(ExecOutput {
                    exit_code: 2,
                    ..Default::default()
                });
            }
            Ok(ExecOutput::default())
        }

        async fn upload(&self, remote_path: &str, bytes: &[u8]) -> Result<(), Diagnosis> {
            self.0.files.lock().insert(remote_path.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn remote_sha256(&self, remote_path: &str) -> Result<Option<String>, Diagnosis> {
            Ok(self
                .0
                .files
                .lock()
                .get(remote_path)
                .map(|bytes| content_sha256(bytes)))
        }
    }

    struct FakeTransport {
        remote: Arc<FakeRemote>,
        connect_error: Option<PreflightFailureKind>,
    }

    #[async_trait]
    impl BridgeTransport for FakeTransport {
        async fn connect(&self, _input: &SetupInput) -> Result<Box<dyn BridgeSession>, Diagnosis> {
            match self.connect_error {
                Some(kind) => Err(Diagnosis::new(kind, "scripted failure")),
                None => Ok(Box::new(FakeSession(self.remote.clone()))),
            }
        }
    }

    struct FakeTelemetry {
        machine: Option<String>,
    }

    #[async_trait]
    impl TelemetryProbe for FakeTelemetry {
        async fn find_machine(&self, _label: &str) -> Option<String> {
            self.machine.clone()
        }
    }

    fn input() -> SetupInput {
        SetupInput {
            label: "edge-1".to_string(),
            host: "198.51.100.4".to_string(),
            port: 22,
            user: "ops".to_string(),
            private_key_path: "~/.ssh/id_ed25519".to_string(),
            trust_on_first_use: true,
            remote_dir: "/opt/openclaw-bridge".to_string(),
            bundle: b"bundle-v1".to_vec(),
            config: b"{\"token\":\"t\"}".to_vec(),
        }
    }

    fn manager(remote: Arc<FakeRemote>, machine: Option<&str>) -> BridgeSetupManager {
        BridgeSetupManager::new(
            Arc::new(FakeTransport {
                remote,
                connect_error: None,
            }),
            Arc::new(FakeTelemetry {
                machine: machine.map(str::to_string),
            }),
        )
    }

    #[tokio::test]
    async fn test_setup_reaches_telemetry_active() {
        let remote = Arc::new(FakeRemote::default());
        let manager = manager(remote.clone(), Some("m-edge-1"));

        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::TelemetryActive);
        assert_eq!(view.machine_id.as_deref(), Some("m-edge-1"));
        // Both artifacts were uploaded.
        assert_eq!(remote.files.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_without_telemetry_stays_running() {
        let remote = Arc::new(FakeRemote::default());
        let manager = manager(remote, None);

        // Paused time auto-advances through the 45s telemetry window.
        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::Running);
        assert!(view.note.expect("note").contains("telemetry"));
    }

    #[tokio::test]
    async fn test_sudo_password_pause_and_resume() {
        let remote = Arc::new(FakeRemote {
            sudo_needs_password: true,
            ..Default::default()
        });
        let manager = manager(remote.clone(), Some("m-edge-1"));

        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::NeedsSudoPassword);

        let resumed = manager
            .retry_install_with_sudo_password(&view.id, "hunter2")
            .await
            .expect("resume");
        assert_eq!(resumed.state, BridgeState::TelemetryActive);
        // The resumed install used sudo -S with the piped password.
        assert!(remote.exec_log.lock().iter().any(|c| c.contains("sudo -S")));
    }

    #[tokio::test]
    async fn test_sudo_failure_falls_back_to_user_mode() {
        let remote = Arc::new(FakeRemote {
            sudo_needs_password: true,
            sudo_always_fails: true,
            ..Default::default()
        });
        let manager = manager(remote.clone(), Some("m-edge-1"));

        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::NeedsSudoPassword);

        let resumed = manager
            .retry_install_with_sudo_password(&view.id, "wrong")
            .await
            .expect("resume");
        assert_eq!(resumed.state, BridgeState::TelemetryActive);
        assert!(
            remote
                .exec_log
                .lock()
                .iter()
                .any(|c| c.contains("--user-mode")),
            "fell back to the user-mode installer"
        );
    }

    #[tokio::test]
    async fn test_unchanged_uploads_skip_restart() {
        let remote = Arc::new(FakeRemote {
            service_active: true,
            ..Default::default()
        });
        // Pre-seed the remote with identical content.
        let input = input();
        remote
            .files
            .lock()
            .insert(input.bundle_path(), input.bundle.clone());
        remote
            .files
            .lock()
            .insert(input.config_path(), input.config.clone());

        let manager = manager(remote.clone(), Some("m-edge-1"));
        let view = manager.setup(input).await;
        assert_eq!(view.state, BridgeState::TelemetryActive);
        // No installer ran.
        assert!(
            !remote
                .exec_log
                .lock()
                .iter()
                .any(|c| c.contains("install.sh"))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_classified() {
        let manager = BridgeSetupManager::new(
            Arc::new(FakeTransport {
                remote: Arc::new(FakeRemote::default()),
                connect_error: Some(PreflightFailureKind::SshNetworkUnreachable),
            }),
            Arc::new(FakeTelemetry { machine: None }),
        );

        let report = manager.preflight(&input()).await;
        assert!(!report.ok);
        assert_eq!(
            report.diagnosis.expect("diagnosis").kind,
            PreflightFailureKind::SshNetworkUnreachable
        );

        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::Error);
        assert!(view.error.is_some());
    }

    #[tokio::test]
    async fn test_installer_failure_is_error() {
        let remote = Arc::new(FakeRemote {
            installer_fails: true,
            ..Default::default()
        });
        let manager = manager(remote, Some("m-edge-1"));
        let view = manager.setup(input()).await;
        assert_eq!(view.state, BridgeState::Error);
        assert_eq!(
            view.error.expect("error").kind,
            PreflightFailureKind::SshExecFailed
        );
    }

    #[tokio::test]
    async fn test_retry_user_mode_forces_user_path() {
        let remote = Arc::new(FakeRemote {
            installer_fails: false,
            ..Default::default()
        });
        let manager = manager(remote.clone(), Some("m-edge-1"));
        let view = manager.setup(input()).await;

        let retried = manager
            .retry_install_user_mode(&view.id)
            .await
            .expect("retry");
        assert_eq!(retried.state, BridgeState::TelemetryActive);
        assert!(remote.exec_log.lock().iter().any(|c| c.contains("--user-mode")));
    }
}
