//! Remote node attachment orchestrator.
//!
//! An attachment binds an endpoint (a remote OpenClaw bridge reachable over
//! SSH) to a forward tunnel and verifies the bridge's local HTTP surface
//! through it before registering anything. A partially opened tunnel is torn
//! down on failure; reconnection after a later tunnel drop is the operator's
//! call, surfaced as a `degraded` attachment.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_tunnel::{OpenForwardRequest, TunnelInfo, TunnelRuntime, TunnelState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_RETRY_ATTEMPTS: u32 = 10;
const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("endpoint '{0}' is already attached")]
    AlreadyAttached(String),
    #[error("attachment '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Tunnel(#[from] patze_tunnel::TunnelError),
    #[error("health check did not pass within the retry window")]
    HealthCheckFailed,
}

// ─── Endpoint config ──────────────────────────────────────────────────────────

/// Everything needed to (re-)attach one endpoint. Stored so scheduled
/// reconnects can re-dial without operator input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub endpoint_id: String,
    pub ssh: OpenForwardRequest,
    /// Bearer token for the bridge's telemetry surface, if it runs in
    /// token mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub endpoint_id: String,
    pub tunnel: TunnelInfo,
    pub ssh_user: String,
    pub health: AttachmentHealth,
    pub attached_at: DateTime<Utc>,
}

struct AttachmentRecord {
    config: EndpointConfig,
    tunnel_id: String,
    ssh_user: String,
    health: AttachmentHealth,
    attached_at: DateTime<Utc>,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct AttachmentOrchestrator {
    tunnels: Arc<TunnelRuntime>,
    attachments: Mutex<HashMap<String, AttachmentRecord>>,
    client: reqwest::Client,
}

impl AttachmentOrchestrator {
    pub fn new(tunnels: Arc<TunnelRuntime>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            tunnels,
            attachments: Mutex::new(HashMap::new()),
            client,
        })
    }

    /// Open a tunnel for the endpoint, verify `GET /health` through it, and
    /// register the attachment. Fails closed: if the probe never passes,
    /// the tunnel is closed before the error is returned.
    pub async fn attach_endpoint(&self, config: EndpointConfig) -> Result<AttachmentInfo, AttachError> {
        {
            let attachments = self.attachments.lock();
            if attachments.contains_key(&config.endpoint_id) {
                return Err(AttachError::AlreadyAttached(config.endpoint_id.clone()));
            }
        }

        let tunnel = self.tunnels.open_forward(config.ssh.clone()).await?;

        if !self.probe_health(&tunnel.local_base_url, config.token.as_deref()).await {
            warn!(endpoint_id = %config.endpoint_id, "health probe failed; tearing down tunnel");
            self.tunnels.close(&tunnel.id);
            return Err(AttachError::HealthCheckFailed);
        }

        let attached_at = Utc::now();
        let record = AttachmentRecord {
            config: config.clone(),
            tunnel_id: tunnel.id.clone(),
            ssh_user: config.ssh.user.clone(),
            health: AttachmentHealth::Healthy,
            attached_at,
        };

        {
            let mut attachments = self.attachments.lock();
            if attachments.contains_key(&config.endpoint_id) {
                // Lost the race to a concurrent attach of the same endpoint.
                drop(attachments);
                self.tunnels.close(&tunnel.id);
                return Err(AttachError::AlreadyAttached(config.endpoint_id.clone()));
            }
            attachments.insert(config.endpoint_id.clone(), record);
        }

        info!(endpoint_id = %config.endpoint_id, tunnel_id = %tunnel.id, "endpoint attached");
        Ok(AttachmentInfo {
            endpoint_id: config.endpoint_id,
            ssh_user: config.ssh.user,
            tunnel,
            health: AttachmentHealth::Healthy,
            attached_at,
        })
    }

    /// Detach an endpoint. Idempotent; optionally leaves the tunnel open
    /// for a caller that wants to re-bind it.
    pub fn detach_endpoint(&self, endpoint_id: &str, close_tunnel: bool) {
        let removed = self.attachments.lock().remove(endpoint_id);
        if let Some(record) = removed {
            if close_tunnel {
                self.tunnels.close(&record.tunnel_id);
            }
            info!(endpoint_id, close_tunnel, "endpoint detached");
        }
    }

    pub fn list_attachments(&self) -> Vec<AttachmentInfo> {
        let attachments = self.attachments.lock();
        let mut out: Vec<AttachmentInfo> = attachments
            .values()
            .filter_map(|record| self.view(record))
            .collect();
        out.sort_by(|a, b| a.attached_at.cmp(&b.attached_at));
        out
    }

    pub fn get_attachment(&self, endpoint_id: &str) -> Option<AttachmentInfo> {
        let attachments = self.attachments.lock();
        attachments.get(endpoint_id).and_then(|record| self.view(record))
    }

    pub fn get_endpoint_config(&self, endpoint_id: &str) -> Option<EndpointConfig> {
        self.attachments.lock().get(endpoint_id).map(|r| r.config.clone())
    }

    /// Re-probe one attachment and record the result. A failed probe (or a
    /// dropped tunnel) marks the attachment degraded rather than removing
    /// it; the operator decides whether to re-attach.
    pub async fn probe(&self, endpoint_id: &str) -> Result<AttachmentHealth, AttachError> {
        let (base_url, token, tunnel_state) = {
            let attachments = self.attachments.lock();
            let record = attachments
                .get(endpoint_id)
                .ok_or_else(|| AttachError::NotFound(endpoint_id.to_string()))?;
            let tunnel = self.tunnels.get(&record.tunnel_id);
            (
                tunnel.as_ref().map(|t| t.local_base_url.clone()),
                record.config.token.clone(),
                tunnel.map(|t| t.state),
            )
        };

        let healthy = matches!(tunnel_state, Some(TunnelState::Open))
            && match base_url {
                Some(url) => self.probe_once(&url, token.as_deref()).await,
                None => false,
            };

        let health = if healthy {
            AttachmentHealth::Healthy
        } else {
            AttachmentHealth::Degraded
        };
        if let Some(record) = self.attachments.lock().get_mut(endpoint_id) {
            record.health = health;
        }
        Ok(health)
    }

    fn view(&self, record: &AttachmentRecord) -> Option<AttachmentInfo> {
        let tunnel = self.tunnels.get(&record.tunnel_id)?;
        Some(AttachmentInfo {
            endpoint_id: record.config.endpoint_id.clone(),
            tunnel,
            ssh_user: record.ssh_user.clone(),
            health: record.health,
            attached_at: record.attached_at,
        })
    }

    async fn probe_health(&self, base_url: &str, token: Option<&str>) -> bool {
        for attempt in 1..=HEALTH_RETRY_ATTEMPTS {
            if self.probe_once(base_url, token).await {
                return true;
            }
            if attempt < HEALTH_RETRY_ATTEMPTS {
                tokio::time::sleep(HEALTH_RETRY_DELAY).await;
            }
        }
        false
    }

    async fn probe_once(&self, base_url: &str, token: Option<&str>) -> bool {
        let mut request = self.client.get(format!("{base_url}/health"));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patze_tunnel::HostVerification;

    fn config(id: &str) -> EndpointConfig {
        EndpointConfig {
            endpoint_id: id.to_string(),
            ssh: OpenForwardRequest {
                host: "198.51.100.7".to_string(),
                port: 22,
                user: "ops".to_string(),
                private_key_path: "/nonexistent/.ssh/id_ed25519".to_string(),
                known_hosts_path: None,
                host_verification: HostVerification::KnownHosts,
                remote_host: "127.0.0.1".to_string(),
                remote_port: 9700,
                local_port: None,
            },
            token: None,
        }
    }

    #[tokio::test]
    async fn test_attach_fails_fast_on_bad_key_path() {
        let orchestrator = AttachmentOrchestrator::new(TunnelRuntime::new());
        let err = orchestrator.attach_endpoint(config("ep-1")).await.expect_err("attach");
        assert!(matches!(err, AttachError::Tunnel(_)));
        assert!(orchestrator.list_attachments().is_empty());
    }

    #[tokio::test]
    async fn test_detach_unknown_is_idempotent() {
        let orchestrator = AttachmentOrchestrator::new(TunnelRuntime::new());
        orchestrator.detach_endpoint("ep-unknown", true);
        assert!(orchestrator.get_endpoint_config("ep-unknown").is_none());
    }

    #[tokio::test]
    async fn test_probe_unknown_reports_not_found() {
        let orchestrator = AttachmentOrchestrator::new(TunnelRuntime::new());
        assert!(matches!(
            orchestrator.probe("ep-unknown").await,
            Err(AttachError::NotFound(_))
        ));
    }
}
