//! Bridge setup manager.
//!
//! Installs the bridge agent on remote hosts over SSH and walks each
//! managed bridge through `installing → needs_sudo_password? → installing →
//! tunnel_open → telemetry_active | running | error | disconnected`.
//!
//! SSH specifics hide behind [`BridgeTransport`] so the state machine is
//! testable without a remote host; [`ssh::Ssh2Transport`] is the production
//! implementation.

#![forbid(unsafe_code)]

pub mod manager;
pub mod ssh;

pub use manager::{
    BridgeSetupManager, BridgeState, BridgeView, INSTALL_DEADLINE, ManagedBridgeError, SetupInput,
    TelemetryProbe,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Preflight diagnosis ──────────────────────────────────────────────────────

/// Classified reasons an SSH connection or install can fail, with operator
/// remediation attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightFailureKind {
    SshKeyUnreadable,
    SshAuthMissing,
    SshAuthFailed,
    SshDnsFailed,
    SshNetworkUnreachable,
    SshTimeout,
    SshHostVerificationFailed,
    SshExecFailed,
    Unknown,
}

impl PreflightFailureKind {
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::SshKeyUnreadable => {
                "check that the private key exists under ~/.ssh and is readable by this user"
            }
            Self::SshAuthMissing => "no private key was configured; add one under ~/.ssh",
            Self::SshAuthFailed => {
                "the key was rejected; confirm the public key is in the remote authorized_keys"
            }
            Self::SshDnsFailed => "the hostname did not resolve; check the host field and DNS",
            Self::SshNetworkUnreachable => {
                "no route to the host; check connectivity, VPN, and firewall rules"
            }
            Self::SshTimeout => "the host did not answer in time; check that sshd is listening",
            Self::SshHostVerificationFailed => {
                "the host key changed or is unknown; verify the fingerprint and update known_hosts"
            }
            Self::SshExecFailed => "connected but could not run commands; check the remote shell",
            Self::Unknown => "unclassified failure; see the bridge log for details",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub kind: PreflightFailureKind,
    pub detail: String,
    pub remediation: String,
}

impl Diagnosis {
    pub fn new(kind: PreflightFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            remediation: kind.remediation().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

// ─── Transport seam ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// sudo's giveaway when `-n` cannot proceed.
    pub fn needs_sudo_password(&self) -> bool {
        self.stderr.contains("password is required")
            || self.stderr.contains("a terminal is required")
    }
}

/// An authenticated session on one remote host.
#[async_trait]
pub trait BridgeSession: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput, Diagnosis>;
    async fn upload(&self, remote_path: &str, bytes: &[u8]) -> Result<(), Diagnosis>;
    /// Hex sha256 of a remote file, or `None` when it does not exist.
    async fn remote_sha256(&self, remote_path: &str) -> Result<Option<String>, Diagnosis>;
}

/// Connects sessions; implemented over ssh2 in production and faked in
/// tests.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn connect(&self, input: &manager::SetupInput) -> Result<Box<dyn BridgeSession>, Diagnosis>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remediation_is_specific() {
        // Every failure class carries a distinct, non-empty hint.
        let kinds = [
            PreflightFailureKind::SshKeyUnreadable,
            PreflightFailureKind::SshAuthMissing,
            PreflightFailureKind::SshAuthFailed,
            PreflightFailureKind::SshDnsFailed,
            PreflightFailureKind::SshNetworkUnreachable,
            PreflightFailureKind::SshTimeout,
            PreflightFailureKind::SshHostVerificationFailed,
            PreflightFailureKind::SshExecFailed,
            PreflightFailureKind::Unknown,
        ];
        let hints: std::collections::HashSet<&str> = kinds.iter().map(|k| k.remediation()).collect();
        assert_eq!(hints.len(), kinds.len());
    }

    #[test]
    fn test_sudo_password_detection() {
        let output = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "sudo: a password is required\n".to_string(),
        };
        assert!(output.needs_sudo_password());

        let ok = ExecOutput {
            exit_code: 0,
            ..Default::default()
        };
        assert!(!ok.needs_sudo_password());
    }

    #[test]
    fn test_failure_kind_wire_format() {
        let json = serde_json::to_string(&PreflightFailureKind::SshHostVerificationFailed)
            .expect("serialize");
        assert_eq!(json, "\"ssh_host_verification_failed\"");
    }
}
