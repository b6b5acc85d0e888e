//! Component wiring: the control surface owns one instance of every
//! subsystem and hands `Arc`s to the route handlers.

use crate::auth::AuthConfig;
use crate::env::EnvConfig;
use crate::journal::OperationJournal;
use crate::ratelimit::RateLimiter;
use crate::settings::SshConnectionStore;
use crate::sse::SseBroker;
use async_trait::async_trait;
use patze_aggregate::Aggregator;
use patze_apply::ConfigCommandQueue;
use patze_attach::AttachmentOrchestrator;
use patze_bridge::{BridgeSetupManager, TelemetryProbe, ssh::Ssh2Transport};
use patze_commands::CommandStore;
use patze_cron::{ControlTaskExecutor, CronService};
use patze_fleet::{AlertRouter, ApprovalStore, EvaluationInput, PolicyStore, evaluate_target, is_fleet_managed};
use patze_proto::FleetTargetStatus;
use patze_sync::{SyncManager, TargetStore};
use patze_telemetry::TelemetryNode;
use patze_tunnel::TunnelRuntime;
use std::sync::Arc;
use tracing::info;

/// Node id under which locally-ingested telemetry is merged.
pub const LOCAL_NODE_ID: &str = "local";

pub struct AppState {
    pub config: EnvConfig,
    pub auth: Arc<AuthConfig>,
    pub journal: Arc<OperationJournal>,
    pub local_node: Arc<TelemetryNode>,
    pub aggregator: Arc<Aggregator>,
    pub tunnels: Arc<TunnelRuntime>,
    pub attachments: Arc<AttachmentOrchestrator>,
    pub targets: Arc<TargetStore>,
    pub sync: Arc<SyncManager>,
    pub commands: Arc<CommandStore>,
    pub apply: Arc<ConfigCommandQueue>,
    pub policies: Arc<PolicyStore>,
    pub approvals: Arc<ApprovalStore>,
    pub alerts: Arc<AlertRouter>,
    pub cron: Arc<CronService>,
    pub bridge_setup: Arc<BridgeSetupManager>,
    pub sse: Arc<SseBroker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ssh_connections: Arc<SshConnectionStore>,
}

pub type SharedState = Arc<AppState>;

/// Lets the bridge installer ask whether a machine has shown up in the
/// unified snapshot yet.
struct AggregatorProbe(Arc<Aggregator>);

#[async_trait]
impl TelemetryProbe for AggregatorProbe {
    async fn find_machine(&self, label: &str) -> Option<String> {
        let snapshot = self.0.snapshot();
        snapshot
            .models
            .machines
            .values()
            .find(|m| m.machine_id == label || m.label.as_deref() == Some(label))
            .map(|m| m.machine_id.clone())
    }
}

impl AppState {
    pub fn build(config: EnvConfig, auth: AuthConfig) -> anyhow::Result<SharedState> {
        std::fs::create_dir_all(&config.settings_dir)?;
        std::fs::create_dir_all(&config.cron_store_dir)?;

        let home = config.home.clone();
        let state_path = config.settings_dir.clone();

        let local_node = TelemetryNode::new();
        let aggregator = Aggregator::new();
        aggregator
            .attach_node(LOCAL_NODE_ID, local_node.clone())
            .map_err(|e| anyhow::anyhow!("failed to attach local node: {e}"))?;

        let tunnels = TunnelRuntime::new();
        let attachments = AttachmentOrchestrator::new(tunnels.clone());
        let targets = Arc::new(TargetStore::new(&config.cron_store_dir, home));
        let sync = SyncManager::new(targets.clone());
        let commands = Arc::new(CommandStore::new(&state_path));
        let apply = Arc::new(ConfigCommandQueue::new(targets.clone(), &state_path));
        let policies = Arc::new(PolicyStore::new(&state_path));
        let approvals = Arc::new(ApprovalStore::new(
            config.fleet.approval_ttl_ms,
            config.fleet.approval_critical_threshold,
        ));
        let alerts = Arc::new(AlertRouter::new(
            &config.settings_dir,
            config.fleet.alert_cooldown_ms,
        ));
        let executor = Arc::new(ControlTaskExecutor::new(
            attachments.clone(),
            aggregator.clone(),
            targets.clone(),
        ));
        let cron = CronService::new(&state_path, executor);
        let bridge_setup = Arc::new(BridgeSetupManager::new(
            Arc::new(Ssh2Transport),
            Arc::new(AggregatorProbe(aggregator.clone())),
        ));

        let state = Arc::new(Self {
            sse: Arc::new(SseBroker::new()),
            rate_limiter: Arc::new(RateLimiter::new(config.cron_sync_rate_limit_max)),
            ssh_connections: Arc::new(SshConnectionStore::new(&config.settings_dir)),
            journal: Arc::new(OperationJournal::new()),
            auth: Arc::new(auth),
            config,
            local_node,
            aggregator,
            tunnels,
            attachments,
            targets,
            sync,
            commands,
            apply,
            policies,
            approvals,
            alerts,
            cron,
            bridge_setup,
        });

        info!("control-plane state assembled");
        Ok(state)
    }

    /// Start the long-lived loops: sync pollers, the cron scheduler, and
    /// the command lease timer.
    pub fn start_background(self: &SharedState) {
        self.sync.start_all();
        self.cron.start();

        let commands = self.commands.clone();
        let approvals = self.approvals.clone();
        let rate_limiter = self.rate_limiter.clone();
        let sse = self.sse.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let report = commands.expire_leases(chrono::Utc::now());
                if !report.requeued.is_empty() || !report.deadlettered.is_empty() {
                    sse.publish("commands.expired", &report);
                }
                approvals.sweep();
                rate_limiter.sweep();
            }
        });

        // Sync status changes flow out over SSE.
        let mut status_rx = self.sync.subscribe();
        let sse = self.sse.clone();
        tokio::spawn(async move {
            while let Ok(update) = status_rx.recv().await {
                sse.publish("sync.status", &update);
            }
        });

        info!("background loops started");
    }

    pub async fn shutdown(self: &SharedState) {
        self.sync.stop_all().await;
        self.cron.stop().await;
        self.tunnels.close_all();
        info!("background loops stopped");
    }

    /// Current config hash for a target's directory ("{}" when absent).
    pub fn target_config_hash(&self, target_id: &str) -> Option<String> {
        let target = self.targets.get(target_id)?;
        Some(patze_sync::current_config_hash(std::path::Path::new(
            &target.openclaw_dir,
        )))
    }

    /// Evaluate one fleet-managed target right now.
    pub fn evaluate_one(&self, target_id: &str) -> Option<FleetTargetStatus> {
        let target = self.targets.get(target_id)?;
        if !is_fleet_managed(&target) {
            return None;
        }
        let mut policy = self.policies.profile_for_target(&target.id);
        if policy.min_bridge_version.is_none() {
            policy.min_bridge_version = self.config.fleet.min_bridge_version.clone();
        }
        let check_in = self.sync.get_check_in(&target.id);
        let sync_status = self.sync.get_status(&target.id);
        let local_hash = patze_sync::current_config_hash(std::path::Path::new(&target.openclaw_dir));

        Some(evaluate_target(EvaluationInput {
            target: &target,
            policy: &policy,
            check_in: check_in.as_ref(),
            sync_status: sync_status.as_ref(),
            local_config_hash: local_hash,
            actual_auth_mode: self.auth.proto_mode(),
            now: chrono::Utc::now(),
        }))
    }

    /// Evaluate every fleet-managed target.
    pub fn evaluate_fleet(&self) -> Vec<FleetTargetStatus> {
        self.targets
            .list()
            .into_iter()
            .filter(is_fleet_managed)
            .filter_map(|t| self.evaluate_one(&t.id))
            .collect()
    }
}
