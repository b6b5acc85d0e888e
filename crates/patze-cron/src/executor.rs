//! Concrete task actions.
//!
//! The scheduler only knows the [`TaskExecutor`] trait; this module carries
//! the production implementation wired to the attachment orchestrator, the
//! telemetry aggregator, and the target store.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use patze_aggregate::Aggregator;
use patze_attach::{AttachmentHealth, AttachmentOrchestrator};
use patze_proto::{ScheduledTask, TaskAction};
use patze_sync::TargetStore;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Default wall-clock budget for `openclaw cron run`.
pub const OPENCLAW_RUN_TIMEOUT_MS: u64 = 60_000;
/// Hard ceiling on the configurable run budget.
pub const OPENCLAW_RUN_TIMEOUT_CAP_MS: u64 = 600_000;
const WEBHOOK_TIMEOUT_MS: u64 = 5_000;
/// Sessions idle longer than this are counted by `cleanup_sessions`.
const STALE_SESSION_MINUTES: i64 = 30;

const ALLOWED_WEBHOOK_METHODS: &[&str] = &["GET", "POST", "PUT"];

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub ok: bool,
    pub summary: String,
}

impl TaskExecution {
    fn ok(summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
        }
    }

    fn failed(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ScheduledTask) -> TaskExecution;
}

// ─── Webhook URL validation ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook URL is malformed")]
    Malformed,
    #[error("webhook URL must use http or https")]
    BadScheme,
    #[error("webhook method '{0}' is not allowed")]
    BadMethod(String),
    #[error("webhook host is not allowed")]
    ForbiddenHost,
    #[error("webhook host did not resolve")]
    Unresolvable,
}

fn ip_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Cloud metadata endpoint.
                || v4.octets() == [169, 254, 169, 254]
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

/// Syntactic validation: scheme, method, and literal-host checks that must
/// reject before any network I/O happens.
pub fn validate_webhook_request(url: &str, method: &str) -> Result<Url, WebhookError> {
    if !ALLOWED_WEBHOOK_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
        return Err(WebhookError::BadMethod(method.to_string()));
    }
    let parsed = Url::parse(url).map_err(|_| WebhookError::Malformed)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::BadScheme);
    }
    match parsed.host() {
        None => return Err(WebhookError::Malformed),
        Some(url::Host::Domain(domain)) => {
            let lowered = domain.to_ascii_lowercase();
            if lowered == "localhost" || lowered.ends_with(".localhost") || lowered.ends_with(".local")
            {
                return Err(WebhookError::ForbiddenHost);
            }
        }
        Some(url::Host::Ipv4(ip)) => {
            if ip_forbidden(IpAddr::V4(ip)) {
                return Err(WebhookError::ForbiddenHost);
            }
        }
        Some(url::Host::Ipv6(ip)) => {
            if ip_forbidden(IpAddr::V6(ip)) {
                return Err(WebhookError::ForbiddenHost);
            }
        }
    }
    Ok(parsed)
}

/// Resolve the host and reject if any address lands in a forbidden range.
/// Runs after the syntactic checks and before the actual request.
async fn check_resolved_addrs(url: &Url) -> Result<(), WebhookError> {
    let Some(host) = url.host_str() else {
        return Err(WebhookError::Malformed);
    };
    // Literal IPs were already vetted syntactically.
    if url.host().is_some_and(|h| !matches!(h, url::Host::Domain(_))) {
        return Ok(());
    }
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| WebhookError::Unresolvable)?
        .collect();
    if addrs.is_empty() {
        return Err(WebhookError::Unresolvable);
    }
    if addrs.iter().any(|addr| ip_forbidden(addr.ip())) {
        return Err(WebhookError::ForbiddenHost);
    }
    Ok(())
}

// ─── Production executor ──────────────────────────────────────────────────────

pub struct ControlTaskExecutor {
    attachments: Arc<AttachmentOrchestrator>,
    aggregator: Arc<Aggregator>,
    targets: Arc<TargetStore>,
    client: reqwest::Client,
    openclaw_binary: String,
    openclaw_run_timeout_ms: u64,
}

impl ControlTaskExecutor {
    pub fn new(
        attachments: Arc<AttachmentOrchestrator>,
        aggregator: Arc<Aggregator>,
        targets: Arc<TargetStore>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(WEBHOOK_TIMEOUT_MS))
            .build()
            .unwrap_or_default();
        Self {
            attachments,
            aggregator,
            targets,
            client,
            openclaw_binary: "openclaw".to_string(),
            openclaw_run_timeout_ms: OPENCLAW_RUN_TIMEOUT_MS,
        }
    }

    pub fn with_openclaw_binary(mut self, binary: impl Into<String>) -> Self {
        self.openclaw_binary = binary.into();
        self
    }

    pub fn with_run_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.openclaw_run_timeout_ms = timeout_ms.min(OPENCLAW_RUN_TIMEOUT_CAP_MS);
        self
    }

    async fn health_check(&self) -> TaskExecution {
        let attachments = self.attachments.list_attachments();
        let total = attachments.len();
        let mut healthy = 0usize;
        for attachment in &attachments {
            if matches!(
                self.attachments.probe(&attachment.endpoint_id).await,
                Ok(AttachmentHealth::Healthy)
            ) {
                healthy += 1;
            }
        }
        TaskExecution {
            ok: healthy == total,
            summary: format!("{healthy}/{total} attachments healthy"),
        }
    }

    async fn reconnect_endpoints(&self) -> TaskExecution {
        let attachments = self.attachments.list_attachments();
        let mut reconnected = 0usize;
        let mut failed = 0usize;

        for attachment in &attachments {
            let health = self.attachments.probe(&attachment.endpoint_id).await;
            if matches!(health, Ok(AttachmentHealth::Healthy)) {
                continue;
            }
            let Some(config) = self.attachments.get_endpoint_config(&attachment.endpoint_id) else {
                failed += 1;
                continue;
            };
            self.attachments.detach_endpoint(&attachment.endpoint_id, true);
            match self.attachments.attach_endpoint(config).await {
                Ok(_) => reconnected += 1,
                Err(e) => {
                    warn!(endpoint_id = %attachment.endpoint_id, error = %e, "reconnect failed");
                    failed += 1;
                }
            }
        }

        TaskExecution {
            ok: failed == 0,
            summary: format!(
                "{reconnected} endpoint(s) reconnected, {failed} failed, {} checked",
                attachments.len()
            ),
        }
    }

    fn cleanup_sessions(&self) -> TaskExecution {
        let snapshot = self.aggregator.snapshot();
        let cutoff = Utc::now() - Duration::minutes(STALE_SESSION_MINUTES);
        let stale = snapshot
            .models
            .sessions
            .values()
            .filter(|s| s.state.is_active() && s.updated_at < cutoff)
            .count();
        // Report only; sessions are owned by their machines.
        TaskExecution::ok(format!(
            "{stale} non-terminal session(s) idle beyond {STALE_SESSION_MINUTES}m"
        ))
    }

    fn generate_report(&self) -> TaskExecution {
        let snapshot = self.aggregator.snapshot();
        let active_runs: usize = snapshot.active_runs_by_machine.values().map(Vec::len).sum();
        info!(
            machines = snapshot.models.machines.len(),
            sessions = snapshot.models.sessions.len(),
            runs = snapshot.models.runs.len(),
            active_runs,
            nodes = snapshot.node_ids.len(),
            events = snapshot.log.len(),
            "fleet telemetry report"
        );
        TaskExecution::ok(format!(
            "{} machines, {} sessions, {} runs ({active_runs} active) across {} nodes",
            snapshot.models.machines.len(),
            snapshot.models.sessions.len(),
            snapshot.models.runs.len(),
            snapshot.node_ids.len()
        ))
    }

    async fn custom_webhook(
        &self,
        url: &str,
        method: &str,
        body: Option<&serde_json::Value>,
    ) -> TaskExecution {
        let parsed = match validate_webhook_request(url, method) {
            Ok(parsed) => parsed,
            Err(e) => return TaskExecution::failed(format!("webhook rejected: {e}")),
        };
        if let Err(e) = check_resolved_addrs(&parsed).await {
            return TaskExecution::failed(format!("webhook rejected: {e}"));
        }

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut request = self.client.request(method, parsed);
        if let Some(body) = body {
            request = request.json(body);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                TaskExecution {
                    ok: status.is_success(),
                    summary: format!("webhook responded {status}"),
                }
            }
            Err(e) => TaskExecution::failed(format!("webhook failed: {e}")),
        }
    }

    async fn openclaw_cron_run(&self, target_id: &str, job_id: &str) -> TaskExecution {
        if !patze_proto::validate_id(job_id) {
            return TaskExecution::failed("invalid job id");
        }
        let Some(target) = self.targets.get(target_id) else {
            return TaskExecution::failed(format!("target '{target_id}' not found"));
        };

        let dir = PathBuf::from(&target.openclaw_dir);
        let spawned = tokio::process::Command::new(&self.openclaw_binary)
            .args(["cron", "run", job_id])
            .current_dir(&dir)
            .env("OPENCLAW_HOME", &dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let timeout = std::time::Duration::from_millis(self.openclaw_run_timeout_ms);
        match tokio::time::timeout(timeout, spawned).await {
            Err(_) => TaskExecution::failed(format!("openclaw cron run {job_id} timed out")),
            Ok(Err(e)) => TaskExecution::failed(format!("spawn failed: {}", e.kind())),
            Ok(Ok(output)) => TaskExecution {
                ok: output.status.success(),
                summary: format!(
                    "openclaw cron run {job_id} exited {}",
                    output.status.code().unwrap_or(-1)
                ),
            },
        }
    }
}

#[async_trait]
impl TaskExecutor for ControlTaskExecutor {
    async fn execute(&self, task: &ScheduledTask) -> TaskExecution {
        match &task.action {
            TaskAction::HealthCheck => self.health_check().await,
            TaskAction::ReconnectEndpoints => self.reconnect_endpoints().await,
            TaskAction::CleanupSessions => self.cleanup_sessions(),
            TaskAction::GenerateReport => self.generate_report(),
            TaskAction::CustomWebhook { url, method, body } => {
                self.custom_webhook(url, method, body.as_ref()).await
            }
            TaskAction::OpenclawCronRun { target_id, job_id } => {
                self.openclaw_cron_run(target_id, job_id).await
            }
        }
    }
}
