//! Fleet policy and drift engine.
//!
//! Continuously compares desired state (the target's policy profile plus
//! the local config hash) against reported state (the latest bridge
//! check-in and sync status), producing drifts, violations, a health score,
//! and a risk level per target. Test and smoke targets are never evaluated.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod approval;
pub mod policy;

pub use alerts::{
    AlertDestination, AlertDestinationKind, AlertRouter, AlertRule, AlertRuleScope, AlertSeverity,
    FleetAlert, alerts_from_status,
};
pub use approval::{ApprovalError, ApprovalStore, BatchApplyItem, BatchApplyRequest, BatchOutcome, BatchSummary, batch_apply, batch_signature};
pub use policy::{DEFAULT_PROFILE_ID, NewPolicyProfile, PolicyError, PolicyStore};

use chrono::{DateTime, Utc};
use patze_proto::{
    AuthMode, BridgeCheckIn, DesiredState, Drift, DriftCategory, DriftSeverity, FleetPolicyProfile,
    FleetTargetStatus, OpenClawSyncStatus, OpenClawTarget, ReportedState, RiskLevel, TargetOrigin,
    TargetPurpose, TargetType, Violation, ViolationSeverity,
};

// ─── Engine configuration ─────────────────────────────────────────────────────

/// Knobs sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct FleetEngineConfig {
    pub enabled: bool,
    pub max_sync_lag_ms: u64,
    pub min_bridge_version: Option<String>,
    pub alert_cooldown_ms: u64,
    pub approval_critical_threshold: usize,
    pub approval_ttl_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for FleetEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sync_lag_ms: 300_000,
            min_bridge_version: None,
            alert_cooldown_ms: 60_000,
            approval_critical_threshold: 3,
            approval_ttl_ms: 5 * 60 * 1000,
            heartbeat_timeout_ms: 120_000,
        }
    }
}

/// Targets excluded from fleet management: test-purpose and smoke-origin.
pub fn is_fleet_managed(target: &OpenClawTarget) -> bool {
    target.enabled
        && target.purpose != TargetPurpose::Test
        && target.origin != TargetOrigin::Smoke
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub target: &'a OpenClawTarget,
    pub policy: &'a FleetPolicyProfile,
    pub check_in: Option<&'a BridgeCheckIn>,
    pub sync_status: Option<&'a OpenClawSyncStatus>,
    /// Hash of the target's local (desired) config.
    pub local_config_hash: String,
    /// Auth mode the control surface is actually running.
    pub actual_auth_mode: AuthMode,
    pub now: DateTime<Utc>,
}

/// Evaluate one target: desired vs reported, drifts, violations, score.
pub fn evaluate_target(input: EvaluationInput<'_>) -> FleetTargetStatus {
    let desired = DesiredState {
        bridge_version: input.policy.min_bridge_version.clone(),
        config_hash: input.local_config_hash.clone(),
        max_sync_lag_ms: input.policy.max_sync_lag_ms,
        allow_auto_remediation: false,
    };

    let sync_lag_ms = sync_lag(input.sync_status, input.check_in, input.now);
    let reported = ReportedState {
        bridge_version: input.check_in.and_then(|c| c.bridge_version.clone()),
        config_hash: input.check_in.map(|c| c.config_hash.clone()),
        heartbeat_at: input.check_in.map(|c| c.heartbeat_at),
        sync_lag_ms,
    };

    let drifts = compute_drifts(&desired, &reported, input.policy, input.sync_status);
    let violations = compute_violations(&drifts, input.policy, input.sync_status, input.actual_auth_mode);
    let health_score = compute_health_score(&HealthInput {
        target: input.target,
        sync_status: input.sync_status,
        has_heartbeat: input.check_in.is_some(),
        sync_lag_ms,
        max_sync_lag_ms: input.policy.max_sync_lag_ms,
        drift_count: drifts.len(),
        violation_count: violations.len(),
    });

    FleetTargetStatus {
        target_id: input.target.id.clone(),
        policy_profile_id: input.policy.id.clone(),
        desired,
        reported,
        drifts,
        violations,
        health_score,
        risk_level: RiskLevel::from_score(health_score),
        updated_at: input.now,
    }
}

fn sync_lag(
    status: Option<&OpenClawSyncStatus>,
    check_in: Option<&BridgeCheckIn>,
    now: DateTime<Utc>,
) -> Option<u64> {
    let reference = status
        .and_then(|s| s.last_successful_sync_at)
        .or_else(|| check_in.map(|c| c.heartbeat_at))?;
    let ms = now.signed_duration_since(reference).num_milliseconds();
    Some(ms.max(0) as u64)
}

fn compute_drifts(
    desired: &DesiredState,
    reported: &ReportedState,
    policy: &FleetPolicyProfile,
    sync_status: Option<&OpenClawSyncStatus>,
) -> Vec<Drift> {
    let mut drifts = Vec::new();

    if let Some(reported_hash) = &reported.config_hash
        && *reported_hash != desired.config_hash
    {
        drifts.push(Drift {
            category: DriftCategory::Config,
            severity: DriftSeverity::Major,
            expected: desired.config_hash.clone(),
            actual: reported_hash.clone(),
        });
    }

    if let (Some(min), Some(reported_version)) =
        (&policy.min_bridge_version, &reported.bridge_version)
        && let (Ok(min), Ok(actual)) = (parse_version(min), parse_version(reported_version))
        && actual < min
    {
        drifts.push(Drift {
            category: DriftCategory::Version,
            severity: DriftSeverity::Major,
            expected: format!(">={min}"),
            actual: actual.to_string(),
        });
    }

    if let Some(lag) = reported.sync_lag_ms
        && lag > policy.max_sync_lag_ms
    {
        // Exactly twice the budget already reads as critical.
        let severity = if lag >= policy.max_sync_lag_ms.saturating_mul(2) {
            DriftSeverity::Critical
        } else {
            DriftSeverity::Minor
        };
        drifts.push(Drift {
            category: DriftCategory::Sync,
            severity,
            expected: format!("<={}ms", policy.max_sync_lag_ms),
            actual: format!("{lag}ms"),
        });
    }

    if let Some(status) = sync_status
        && status.consecutive_failures >= 3
    {
        drifts.push(Drift {
            category: DriftCategory::Runtime,
            severity: DriftSeverity::Critical,
            expected: "0 consecutive failures".to_string(),
            actual: format!("{} consecutive failures", status.consecutive_failures),
        });
    }

    drifts
}

fn compute_violations(
    drifts: &[Drift],
    policy: &FleetPolicyProfile,
    sync_status: Option<&OpenClawSyncStatus>,
    actual_auth_mode: AuthMode,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for drift in drifts {
        violations.push(Violation {
            code: format!("drift_{}", drift.category),
            severity: match drift.severity {
                DriftSeverity::Minor => ViolationSeverity::Warn,
                DriftSeverity::Major => ViolationSeverity::High,
                DriftSeverity::Critical => ViolationSeverity::Critical,
            },
            message: format!(
                "{} drift: expected {}, got {}",
                drift.category, drift.expected, drift.actual
            ),
        });
    }

    if !sync_status.is_some_and(|s| s.running) {
        violations.push(Violation {
            code: "sync_not_running".to_string(),
            severity: ViolationSeverity::Warn,
            message: "sync poller is not running for this target".to_string(),
        });
    }

    if let Some(status) = sync_status
        && status.consecutive_failures > policy.max_consecutive_failures
    {
        violations.push(Violation {
            code: "failure_burst".to_string(),
            severity: ViolationSeverity::High,
            message: format!(
                "{} consecutive sync failures exceed the policy budget of {}",
                status.consecutive_failures, policy.max_consecutive_failures
            ),
        });
    }

    if policy.allowed_auth_mode != AuthMode::Any && actual_auth_mode != policy.allowed_auth_mode {
        violations.push(Violation {
            code: "auth_mode_mismatch".to_string(),
            severity: ViolationSeverity::Warn,
            message: "control surface auth mode differs from the policy's allowed mode".to_string(),
        });
    }

    violations
}

struct HealthInput<'a> {
    target: &'a OpenClawTarget,
    sync_status: Option<&'a OpenClawSyncStatus>,
    has_heartbeat: bool,
    sync_lag_ms: Option<u64>,
    max_sync_lag_ms: u64,
    drift_count: usize,
    violation_count: usize,
}

fn compute_health_score(input: &HealthInput<'_>) -> u8 {
    let mut score: i32 = 100;

    let running = input.sync_status.is_some_and(|s| s.running);
    let available = input.sync_status.is_some_and(|s| s.available);
    let stale = input.sync_status.is_some_and(|s| s.stale);
    let failures = input
        .sync_status
        .map(|s| s.consecutive_failures)
        .unwrap_or(0);

    if !running {
        score -= 15;
    }
    if !available {
        score -= 20;
    }
    if stale {
        score -= 15;
    }
    score -= 5 * failures.min(4) as i32;
    if input.target.target_type == TargetType::Remote && !input.has_heartbeat {
        score -= 20;
    }
    if input.sync_lag_ms.is_some_and(|lag| lag > input.max_sync_lag_ms) {
        score -= 10;
    }
    score -= 8 * input.drift_count as i32;
    score -= 5 * input.violation_count as i32;

    score.clamp(0, 100) as u8
}

fn parse_version(raw: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(raw.trim_start_matches('v'))
}
