//! Shared data model for the Patze fleet control plane.
//!
//! Defines the telemetry event envelope, the OpenClaw target and sync types,
//! the bridge command lifecycle, fleet policy types, and the error taxonomy
//! surfaced to API callers. Wire-facing structs serialize camelCase to match
//! what bridges and the operator UI exchange.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope version accepted by the telemetry ingestor.
pub const TELEMETRY_VERSION: &str = "telemetry.v1";

// ─── Telemetry events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Discriminator for telemetry events. The dotted wire names are the
/// contract with bridge agents; adding a variant is a protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "machine.registered")]
    MachineRegistered,
    #[serde(rename = "machine.heartbeat")]
    MachineHeartbeat,
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "session.ended")]
    SessionEnded,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.updated")]
    RunUpdated,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "tool.invoked")]
    ToolInvoked,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    #[serde(rename = "log.emitted")]
    LogEmitted,
    #[serde(rename = "span.started")]
    SpanStarted,
    #[serde(rename = "span.ended")]
    SpanEnded,
}

impl EventKind {
    /// Wire name, e.g. `run.started`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MachineRegistered => "machine.registered",
            Self::MachineHeartbeat => "machine.heartbeat",
            Self::SessionStarted => "session.started",
            Self::SessionUpdated => "session.updated",
            Self::SessionEnded => "session.ended",
            Self::RunStarted => "run.started",
            Self::RunUpdated => "run.updated",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::ToolInvoked => "tool.invoked",
            Self::ToolCompleted => "tool.completed",
            Self::LogEmitted => "log.emitted",
            Self::SpanStarted => "span.started",
            Self::SpanEnded => "span.ended",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// A validated telemetry event as stored in an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub version: String,
    pub id: String,
    pub ts: DateTime<Utc>,
    pub machine_id: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

// ─── Run lifecycle ────────────────────────────────────────────────────────────

/// Lifecycle states for sessions and runs. Terminal states are sticky in
/// every projection: once a run is completed/failed/cancelled, later
/// non-terminal events for the same id are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    Queued,
    Running,
    WaitingTool,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingTool => "waiting_tool",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ─── Read models ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    pub machine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub event_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub machine_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: String,
    pub session_id: String,
    pub machine_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_invocations: u64,
}

// ─── OpenClaw targets ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOrigin {
    User,
    Auto,
    Smoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPurpose {
    Production,
    Test,
}

/// One OpenClaw installation known to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawTarget {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub origin: TargetOrigin,
    pub purpose: TargetPurpose,
    pub openclaw_dir: String,
    pub poll_interval_ms: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpenClawTarget {
    /// `origin=smoke` targets are always test targets.
    pub fn invariants_hold(&self) -> bool {
        self.origin != TargetOrigin::Smoke || self.purpose == TargetPurpose::Test
    }
}

// ─── OpenClaw cron spool ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawCronJob {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// On-disk format of `<openclawDir>/cron/jobs.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobsFile {
    pub version: u32,
    pub jobs: Vec<OpenClawCronJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronRunStatus {
    Ok,
    Error,
    Timeout,
    Running,
}

/// One line of `runs/<safe(jobId)>.jsonl`. Bridges append; the sync
/// manager reads forward-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub job_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CronRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawSyncStatus {
    pub running: bool,
    pub available: bool,
    pub poll_interval_ms: u64,
    pub jobs_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stale: bool,
}

impl OpenClawSyncStatus {
    /// A sync is stale when the last success is older than 3× the poll
    /// interval (or has never happened while the poller runs).
    pub fn compute_stale(
        last_successful_sync_at: Option<DateTime<Utc>>,
        poll_interval_ms: u64,
        now: DateTime<Utc>,
    ) -> bool {
        match last_successful_sync_at {
            Some(at) => {
                let age_ms = now.signed_duration_since(at).num_milliseconds();
                age_ms > (poll_interval_ms as i64).saturating_mul(3)
            }
            None => true,
        }
    }
}

// ─── Bridge commands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandIntent {
    RunCommand,
    AgentSetEnabled,
    TriggerJob,
    ApproveRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
    Rejected,
    Deadletter,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Deadletter
        )
    }
}

/// The immutable intent captured at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSnapshot {
    pub target_id: String,
    pub machine_id: String,
    /// Config hash of the target at enqueue time; approval re-checks it.
    pub target_version: String,
    pub intent: CommandIntent,
    pub args: Vec<String>,
    pub created_by: String,
    pub idempotency_key: String,
    pub approval_required: bool,
    pub policy_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub status: CommandOutcome,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCommand {
    pub id: String,
    pub snapshot: CommandSnapshot,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_machine_id: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
}

// ─── Fleet policy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    #[default]
    Token,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetPolicyProfile {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bridge_version: Option<String>,
    pub max_sync_lag_ms: u64,
    pub allowed_auth_mode: AuthMode,
    pub max_consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FleetPolicyProfile {
    /// The built-in profile applied to targets with no explicit assignment.
    pub fn default_profile(now: DateTime<Utc>) -> Self {
        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            min_bridge_version: None,
            max_sync_lag_ms: 300_000,
            allowed_auth_mode: AuthMode::Any,
            max_consecutive_failures: 5,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftCategory {
    Config,
    Version,
    Sync,
    Runtime,
}

impl std::fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Version => "version",
            Self::Sync => "sync",
            Self::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub category: DriftCategory,
    pub severity: DriftSeverity,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Warn,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub code: String,
    pub severity: ViolationSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            85..=100 => Self::Low,
            65..=84 => Self::Medium,
            40..=64 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Desired state derived from the assigned policy profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_version: Option<String>,
    pub config_hash: String,
    pub max_sync_lag_ms: u64,
    pub allow_auto_remediation: bool,
}

/// Reported state derived from the most recent bridge check-in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_lag_ms: Option<u64>,
}

/// Derived per-target status. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetTargetStatus {
    pub target_id: String,
    pub policy_profile_id: String,
    pub desired: DesiredState,
    pub reported: ReportedState,
    pub drifts: Vec<Drift>,
    pub violations: Vec<Violation>,
    pub health_score: u8,
    pub risk_level: RiskLevel,
    pub updated_at: DateTime<Utc>,
}

// ─── Config snapshots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub id: String,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub note: String,
    /// Byte-exact contents of `openclaw.json` at snapshot time.
    pub raw_config: String,
}

/// One pending CLI invocation in the config command queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub description: String,
}

// ─── Scheduled tasks ──────────────────────────────────────────────────────────

/// When a user-defined task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSchedule {
    /// Fire once at a fixed instant.
    At { at: DateTime<Utc> },
    /// Fire on a fixed period.
    Every { every_ms: u64 },
    /// Five-field cron expression, minute resolution.
    Cron { expr: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskAction {
    HealthCheck,
    ReconnectEndpoints,
    CleanupSessions,
    GenerateReport,
    CustomWebhook {
        url: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    OpenclawCronRun {
        target_id: String,
        job_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub schedule: TaskSchedule,
    pub action: TaskAction,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunRecord {
    pub task_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ok: bool,
    pub summary: String,
}

// ─── Bridge check-in ──────────────────────────────────────────────────────────

/// The durable residue of a bridge's most recent cron-sync check-in, fed to
/// the fleet engine as reported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCheckIn {
    pub machine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_version: Option<String>,
    pub config_hash: String,
    pub heartbeat_at: DateTime<Utc>,
}

// ─── Bridge cron-sync wire types ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCronSyncRequest {
    pub machine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_version: Option<String>,
    pub jobs_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<OpenClawCronJob>>,
    pub config_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_raw: Option<String>,
    #[serde(default)]
    pub new_runs: std::collections::HashMap<String, Vec<CronRunRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCronSyncResponse {
    pub ok: bool,
    pub target_id: String,
    pub jobs_applied: bool,
    pub config_applied: bool,
    pub run_delta_jobs: usize,
}

// ─── Error taxonomy ───────────────────────────────────────────────────────────

/// Error codes surfaced to API callers, serialized as the `error` field of
/// the JSON error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid_body")]
    InvalidBody,
    #[error("payload_too_large")]
    PayloadTooLarge,
    #[error("unsupported_media_type")]
    UnsupportedMediaType,
    #[error("rate_limited")]
    RateLimited,
    #[error("not_found")]
    NotFound,
    #[error("target_not_found")]
    TargetNotFound,
    #[error("target_version_mismatch")]
    TargetVersionMismatch,
    #[error("invalid_transition")]
    InvalidTransition,
    #[error("approval_required")]
    ApprovalRequired,
    #[error("approval_not_found")]
    ApprovalNotFound,
    #[error("approval_expired")]
    ApprovalExpired,
    #[error("approval_signature_mismatch")]
    ApprovalSignatureMismatch,
    #[error("command_blocked")]
    CommandBlocked,
    #[error("smart_fleet_disabled")]
    SmartFleetDisabled,
    #[error("snapshot_not_found")]
    SnapshotNotFound,
    #[error("preflight_failed")]
    PreflightFailed,
    #[error("install_failed")]
    InstallFailed,
    #[error("reconcile_failed")]
    ReconcileFailed,
    #[error("internal_server_error")]
    InternalServerError,
}

/// JSON error envelope `{error, message?}`. Messages never contain
/// filesystem paths or internal addresses.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{error}")]
pub struct ApiError {
    pub error: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            error,
            message: None,
        }
    }

    pub fn with_message(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: Some(message.into()),
        }
    }
}

// ─── Identifier helpers ───────────────────────────────────────────────────────

/// Validate an opaque identifier: non-empty, bounded, no whitespace.
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// New v4 id with a short family prefix, e.g. `cmd-4f2a…`.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}
