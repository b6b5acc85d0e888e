//! End-to-end flows across crates:
//! - fan-in ordering is attachment-order independent
//! - terminal run states stay terminal through the unified projection
//! - bridge cron-sync check-ins are idempotent on disk
//! - the approval gate holds mutating commands until a version-checked
//!   approval lands
//! - config applies roll back byte-identical on failure
//! - batch policy applies hold for approval over the critical threshold

use patze_aggregate::Aggregator;
use patze_fleet::{ApprovalStore, BatchApplyItem, BatchApplyRequest, BatchOutcome, PolicyStore};
use patze_proto::{
    BridgeCronSyncRequest, CommandIntent, CommandState, DesiredState, ReportedState, RiskLevel,
};
use patze_sync::TargetStore;
use patze_telemetry::TelemetryNode;
use patze_tests::{TestWorld, telemetry_event};
use std::collections::HashMap;
use std::sync::Arc;

// ─── Fan-in ordering ──────────────────────────────────────────────────────────

#[test]
fn test_unified_log_is_attachment_order_independent() {
    let build = || {
        let a = TelemetryNode::new();
        a.ingest(&telemetry_event("a1", "2026-01-15T10:00:00Z", "m-a", "machine.heartbeat", serde_json::json!({})));
        let b = TelemetryNode::new();
        b.ingest(&telemetry_event("a2", "2026-01-15T10:00:00Z", "m-b", "machine.heartbeat", serde_json::json!({})));
        (a, b)
    };

    let (a, b) = build();
    let forward = Aggregator::new();
    forward.attach_node("node-a", a).expect("attach");
    forward.attach_node("node-b", b).expect("attach");

    let (a, b) = build();
    let backward = Aggregator::new();
    backward.attach_node("node-b", b).expect("attach");
    backward.attach_node("node-a", a).expect("attach");

    let ids = |agg: &Aggregator| -> Vec<String> {
        agg.snapshot().log.iter().map(|e| e.event.id.clone()).collect()
    };
    // Same ts: the id breaks the tie, in both attachment orders.
    assert_eq!(ids(&forward), vec!["a1", "a2"]);
    assert_eq!(ids(&backward), vec!["a1", "a2"]);
}

#[test]
fn test_terminal_run_state_sticky_across_nodes() {
    let node = TelemetryNode::new();
    let aggregator = Aggregator::new();
    aggregator.attach_node("n", node.clone()).expect("attach");

    node.ingest(&telemetry_event(
        "e1",
        "2026-01-15T10:00:00Z",
        "m-1",
        "run.started",
        serde_json::json!({"runId": "r-1", "sessionId": "s-1"}),
    ));
    node.ingest(&telemetry_event(
        "e2",
        "2026-01-15T10:00:01Z",
        "m-1",
        "run.cancelled",
        serde_json::json!({"runId": "r-1"}),
    ));
    // A late non-terminal update must not resurrect the run.
    node.ingest(&telemetry_event(
        "e3",
        "2026-01-15T10:00:02Z",
        "m-1",
        "run.updated",
        serde_json::json!({"runId": "r-1", "state": "running"}),
    ));

    let snapshot = aggregator.snapshot();
    let run = snapshot.models.runs.get("r-1").expect("run");
    assert_eq!(run.state, patze_proto::RunState::Cancelled);
    assert!(snapshot.active_runs_by_machine.get("m-1").is_none());
}

// ─── Cron-sync idempotency ────────────────────────────────────────────────────

#[test]
fn test_cron_sync_idempotent_on_disk() {
    let world = TestWorld::new();
    let request = BridgeCronSyncRequest {
        machine_id: "m-1".to_string(),
        machine_label: None,
        bridge_version: Some("1.2.0".to_string()),
        jobs_hash: "jh-1".to_string(),
        jobs: Some(vec![patze_proto::OpenClawCronJob {
            id: "nightly".to_string(),
            name: "nightly".to_string(),
            schedule: Some("0 3 * * *".to_string()),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        }]),
        config_hash: "ch-1".to_string(),
        config_raw: Some("{\"a\":1}".to_string()),
        new_runs: HashMap::new(),
        sent_at: None,
    };

    patze_sync::apply_cron_sync(&world.openclaw_dir, &request).expect("first apply");

    let read_all = || -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        let mut stack = vec![world.openclaw_dir.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).expect("read_dir") {
                let entry = entry.expect("entry");
                if entry.file_type().expect("type").is_dir() {
                    stack.push(entry.path());
                } else {
                    out.push((
                        entry.path().to_string_lossy().into_owned(),
                        std::fs::read(entry.path()).expect("read"),
                    ));
                }
            }
        }
        out.sort();
        out
    };

    let before = read_all();
    let applied = patze_sync::apply_cron_sync(&world.openclaw_dir, &request).expect("second apply");
    assert!(!applied.jobs_applied);
    assert!(!applied.config_applied);
    assert_eq!(applied.run_delta_jobs, 0);
    // Byte-identical tree.
    assert_eq!(before, read_all());
}

// ─── Approval gate ────────────────────────────────────────────────────────────

#[test]
fn test_approval_gate_end_to_end() {
    let world = TestWorld::new();
    world.write_config("{\"a\":1}");
    let current_hash = patze_sync::current_config_hash(&world.openclaw_dir);

    let commands = patze_commands::CommandStore::new(&world.config.settings_dir);
    let command = commands.enqueue(patze_commands::EnqueueRequest {
        target_id: "t-1".to_string(),
        machine_id: "m-1".to_string(),
        target_version: current_hash.clone(),
        intent: CommandIntent::RunCommand,
        args: ["openclaw", "config", "set", "foo", "bar"]
            .into_iter()
            .map(str::to_string)
            .collect(),
        created_by: "operator".to_string(),
        idempotency_key: None,
        policy_version: 1,
    });
    assert!(command.snapshot.approval_required);

    // Unapproved: the bridge sees nothing.
    assert!(commands.poll("m-1", None).is_none());

    // Wrong target version fails the approval.
    assert!(matches!(
        commands.approve(&command.id, "op", "stale", &current_hash),
        Err(patze_commands::CommandError::TargetVersionMismatch)
    ));

    commands
        .approve(&command.id, "op", &current_hash, &current_hash)
        .expect("approve");
    let leased = commands.poll("m-1", None).expect("leased after approval");
    assert_eq!(leased.id, command.id);
    assert_eq!(leased.state, CommandState::Leased);
}

// ─── Transactional config apply ───────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn test_apply_failure_restores_config_bytes() {
    let world = TestWorld::new();
    world.write_config("{\"a\":1}");

    let targets = Arc::new(TargetStore::new(&world.config.cron_store_dir, world.home.clone()));
    let target = targets
        .create(patze_tests::target_in(&world.openclaw_dir))
        .expect("target");

    let queue = patze_apply::ConfigCommandQueue::with_allowed_binary(
        targets,
        &world.config.settings_dir,
        "/bin/sh",
    );
    queue
        .queue_command(
            &target.id,
            patze_proto::CliInvocation {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "printf '{\"a\":2}' > openclaw.json".to_string()],
                description: "mutate".to_string(),
            },
        )
        .expect("queue");
    queue
        .queue_command(
            &target.id,
            patze_proto::CliInvocation {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "exit 7".to_string()],
                description: "boom".to_string(),
            },
        )
        .expect("queue");

    let result = queue.apply(&target.id, "test").await.expect("apply");
    assert!(!result.ok);
    assert_eq!(
        std::fs::read(world.openclaw_dir.join("openclaw.json")).expect("read"),
        b"{\"a\":1}"
    );
}

// ─── Batch approval threshold ─────────────────────────────────────────────────

#[test]
fn test_batch_apply_threshold_and_token_single_use() {
    let world = TestWorld::new();
    let policies = PolicyStore::new(&world.config.settings_dir);
    let approvals = ApprovalStore::new(5 * 60 * 1000, 3);

    let items: Vec<BatchApplyItem> = (0..5)
        .map(|i| BatchApplyItem {
            target_id: format!("t-{i}"),
            policy_id: "default".to_string(),
        })
        .collect();
    let mut request = BatchApplyRequest {
        items,
        reconcile_after_apply: false,
        approval_token: None,
    };

    // Four of five would become critical, over the threshold of three.
    let preview = |item: &BatchApplyItem| {
        let score: u8 = if item.target_id == "t-4" { 95 } else { 5 };
        Some(patze_proto::FleetTargetStatus {
            target_id: item.target_id.clone(),
            policy_profile_id: "default".to_string(),
            desired: DesiredState {
                bridge_version: None,
                config_hash: "h".to_string(),
                max_sync_lag_ms: 300_000,
                allow_auto_remediation: false,
            },
            reported: ReportedState::default(),
            drifts: vec![],
            violations: vec![],
            health_score: score,
            risk_level: RiskLevel::from_score(score),
            updated_at: chrono::Utc::now(),
        })
    };

    let token = match patze_fleet::batch_apply(&request, &policies, &approvals, preview)
        .expect("gated")
    {
        BatchOutcome::ApprovalRequired { token, .. } => token,
        BatchOutcome::Applied { .. } => panic!("expected approval gate"),
    };

    request.approval_token = Some(token);
    match patze_fleet::batch_apply(&request, &policies, &approvals, preview).expect("applied") {
        BatchOutcome::Applied { summary } => assert_eq!(summary.applied, 5),
        BatchOutcome::ApprovalRequired { .. } => panic!("expected application"),
    }

    // Token reuse fails as not-found.
    assert!(matches!(
        patze_fleet::batch_apply(&request, &policies, &approvals, preview),
        Err(patze_fleet::ApprovalError::NotFound)
    ));
}

// ─── Sync manager + fleet drift over a real spool ────────────────────────────

#[tokio::test]
async fn test_sync_failure_burst_surfaces_runtime_drift() {
    let world = TestWorld::new();
    let targets = Arc::new(TargetStore::new(&world.config.cron_store_dir, world.home.clone()));
    let target = targets
        .create(patze_tests::target_in(&world.openclaw_dir))
        .expect("target");
    let sync = patze_sync::SyncManager::new(targets.clone());

    // Corrupt jobs file: three ticks, three consecutive failures.
    std::fs::create_dir_all(world.openclaw_dir.join("cron")).expect("mkdir");
    std::fs::write(world.openclaw_dir.join("cron").join("jobs.json"), "{bad").expect("write");
    for _ in 0..3 {
        sync.tick(&target.id, &world.openclaw_dir);
    }
    let status = sync.get_status(&target.id).expect("status");
    assert_eq!(status.consecutive_failures, 3);

    let policy = patze_proto::FleetPolicyProfile::default_profile(chrono::Utc::now());
    let evaluated = patze_fleet::evaluate_target(patze_fleet::EvaluationInput {
        target: &target,
        policy: &policy,
        check_in: None,
        sync_status: Some(&status),
        local_config_hash: "h".to_string(),
        actual_auth_mode: patze_proto::AuthMode::Any,
        now: chrono::Utc::now(),
    });

    assert!(
        evaluated
            .drifts
            .iter()
            .any(|d| d.category == patze_proto::DriftCategory::Runtime
                && d.severity == patze_proto::DriftSeverity::Critical)
    );
    assert!(evaluated.violations.iter().any(|v| v.code == "drift_runtime"));
    assert!(evaluated.health_score < 100);
}
