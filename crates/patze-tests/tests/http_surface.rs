//! The control surface over a real socket: auth enforcement, telemetry
//! ingest, target CRUD, and the journal.

use patze_control::build_router;
use patze_tests::{TestWorld, telemetry_event};
use std::net::SocketAddr;

async fn serve(state: patze_control::SharedState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let router = build_router(state);
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (addr, handle)
}

#[tokio::test]
async fn test_health_is_open_but_api_needs_token() {
    let world = TestWorld::new();
    let state = world.state_with_token("s3cret");
    let (addr, server) = serve(state).await;
    let client = reqwest::Client::new();

    // /health needs no token.
    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health");
    assert!(health.status().is_success());

    // API routes reject missing and wrong tokens.
    let denied = client
        .get(format!("http://{addr}/openclaw/targets"))
        .send()
        .await
        .expect("request");
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = denied.json().await.expect("body");
    assert_eq!(body["error"], "unauthorized");

    let wrong = client
        .get(format!("http://{addr}/openclaw/targets"))
        .bearer_auth("nope")
        .send()
        .await
        .expect("request");
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

    // The right token passes.
    let allowed = client
        .get(format!("http://{addr}/openclaw/targets"))
        .bearer_auth("s3cret")
        .send()
        .await
        .expect("request");
    assert!(allowed.status().is_success());

    server.abort();
}

#[tokio::test]
async fn test_ingest_reaches_unified_snapshot() {
    let world = TestWorld::new();
    let state = world.state();
    let (addr, server) = serve(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/telemetry/events"))
        .json(&telemetry_event(
            "e-1",
            "2026-01-15T10:00:00Z",
            "m-1",
            "run.started",
            serde_json::json!({"runId": "r-1", "sessionId": "s-1"}),
        ))
        .send()
        .await
        .expect("ingest");
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("body");
    assert_eq!(body["ok"], true);

    // Duplicate id is reported, not stored twice.
    let dup = client
        .post(format!("http://{addr}/telemetry/events"))
        .json(&telemetry_event(
            "e-1",
            "2026-01-15T10:00:00Z",
            "m-1",
            "run.started",
            serde_json::json!({"runId": "r-1", "sessionId": "s-1"}),
        ))
        .send()
        .await
        .expect("ingest");
    let dup_body: serde_json::Value = dup.json().await.expect("body");
    assert_eq!(dup_body["ok"], false);
    assert_eq!(dup_body["error"], "duplicate_id");

    let snapshot: serde_json::Value = client
        .get(format!("http://{addr}/telemetry/snapshot"))
        .send()
        .await
        .expect("snapshot")
        .json()
        .await
        .expect("body");
    assert_eq!(snapshot["log"].as_array().expect("log").len(), 1);
    assert_eq!(snapshot["models"]["runs"]["r-1"]["state"], "running");

    server.abort();
}

#[tokio::test]
async fn test_target_crud_and_journal() {
    let world = TestWorld::new();
    let state = world.state();
    let (addr, server) = serve(state).await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("http://{addr}/openclaw/targets"))
        .json(&serde_json::json!({
            "label": "primary",
            "type": "local",
            "origin": "user",
            "purpose": "production",
            "openclawDir": world.openclaw_dir.to_string_lossy(),
            "pollIntervalMs": 2000,
        }))
        .send()
        .await
        .expect("create")
        .json()
        .await
        .expect("body");
    let target_id = created["id"].as_str().expect("id").to_string();

    // Unsafe directory is rejected with the error envelope.
    let rejected = client
        .post(format!("http://{addr}/openclaw/targets"))
        .json(&serde_json::json!({
            "label": "bad",
            "type": "local",
            "origin": "user",
            "purpose": "production",
            "openclawDir": "/etc/openclaw",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

    let listed: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/openclaw/targets"))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("body");
    assert_eq!(listed.len(), 1);

    let removed = client
        .delete(format!("http://{addr}/openclaw/targets/{target_id}"))
        .send()
        .await
        .expect("delete");
    assert!(removed.status().is_success());

    // The journal saw both mutations (and the failed create).
    let journal: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/journal"))
        .send()
        .await
        .expect("journal")
        .json()
        .await
        .expect("body");
    assert!(journal.len() >= 3);
    assert!(journal.iter().any(|e| e["operation"] == "target.remove"));
    assert!(
        journal
            .iter()
            .any(|e| e["operation"] == "target.create" && e["state"] == "failed")
    );

    server.abort();
}

#[tokio::test]
async fn test_bridge_cron_sync_roundtrip() {
    let world = TestWorld::new();
    let state = world.state();
    let (addr, server) = serve(state).await;
    let client = reqwest::Client::new();

    let response: serde_json::Value = client
        .post(format!("http://{addr}/openclaw/bridge/cron-sync"))
        .json(&serde_json::json!({
            "machineId": "m-edge-1",
            "machineLabel": "edge 1",
            "bridgeVersion": "1.4.0",
            "jobsHash": "jh",
            "jobs": [{"id": "nightly", "name": "nightly", "enabled": true}],
            "configHash": "ch",
            "configRaw": "{\"a\":1}",
            "newRuns": {"nightly": [{
                "jobId": "nightly",
                "runId": "r-1",
                "startedAt": "2026-01-15T03:00:00Z",
                "status": "ok"
            }]}
        }))
        .send()
        .await
        .expect("cron-sync")
        .json()
        .await
        .expect("body");

    assert_eq!(response["ok"], true);
    assert_eq!(response["jobsApplied"], true);
    assert_eq!(response["configApplied"], true);
    assert_eq!(response["runDeltaJobs"], 1);
    let target_id = response["targetId"].as_str().expect("target");

    // The auto-created target now reports jobs through the sync manager.
    let jobs: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/openclaw/targets/{target_id}/jobs"))
        .send()
        .await
        .expect("jobs")
        .json()
        .await
        .expect("body");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], "nightly");

    let runs: serde_json::Value = client
        .get(format!(
            "http://{addr}/openclaw/targets/{target_id}/jobs/nightly/runs"
        ))
        .send()
        .await
        .expect("runs")
        .json()
        .await
        .expect("body");
    assert_eq!(runs["runs"].as_array().expect("runs").len(), 1);

    server.abort();
}
