//! Bridge-facing surface: cron-sync check-ins and the pull-model command
//! lifecycle, plus the operator's enqueue/approve/reject side.

use crate::error::{HttpError, bad_request};
use crate::ratelimit::RateDecision;
use crate::state::SharedState;
use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use patze_commands::{CommandError, EnqueueRequest};
use patze_fleet::alerts_from_status;
use patze_proto::{
    ApiError, BridgeCheckIn, BridgeCommand, BridgeCronSyncRequest, BridgeCronSyncResponse,
    CommandResultPayload, ErrorCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use tracing::warn;

fn map_command_error(e: CommandError) -> HttpError {
    let error = match &e {
        CommandError::NotFound(_) => ApiError::with_message(ErrorCode::NotFound, "unknown command"),
        CommandError::TargetVersionMismatch => ApiError::new(ErrorCode::TargetVersionMismatch),
        CommandError::InvalidTransition(detail) => {
            ApiError::with_message(ErrorCode::InvalidTransition, detail.clone())
        }
        CommandError::NotOwner(_) => {
            ApiError::with_message(ErrorCode::InvalidTransition, "lease owned by another machine")
        }
        CommandError::ApprovalNotRequired => {
            ApiError::with_message(ErrorCode::InvalidTransition, "command does not require approval")
        }
    };
    HttpError(error)
}

// ─── Cron-sync check-in ───────────────────────────────────────────────────────

pub async fn cron_sync(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<BridgeCronSyncRequest>,
) -> Result<Response, HttpError> {
    if !patze_proto::validate_id(&request.machine_id) {
        return Err(bad_request("invalid machineId"));
    }

    let source_ip = peer.ip().to_string();
    if let RateDecision::Limited { retry_after_secs } =
        state.rate_limiter.check(&request.machine_id, &source_ip)
    {
        let body = Json(ApiError::new(ErrorCode::RateLimited));
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", retry_after_secs.to_string())],
            body,
        )
            .into_response());
    }

    let op = state.journal.begin("bridge.cron_sync");
    let target = state
        .targets
        .ensure_auto_target(&request.machine_id, request.machine_label.as_deref())
        .map_err(|e| {
            state.journal.fail(op, e.to_string());
            bad_request(e.to_string())
        })?;

    let applied = patze_sync::apply_cron_sync(FsPath::new(&target.openclaw_dir), &request)
        .map_err(|e| {
            state.journal.fail(op, e.to_string());
            warn!(target_id = %target.id, error = %e, "cron-sync spool write failed");
            crate::error::internal()
        })?;

    state.sync.record_check_in(
        &target.id,
        BridgeCheckIn {
            machine_id: request.machine_id.clone(),
            machine_label: request.machine_label.clone(),
            bridge_version: request.bridge_version.clone(),
            config_hash: request.config_hash.clone(),
            heartbeat_at: request.sent_at.unwrap_or_else(Utc::now),
        },
    );

    // Reflect the new spool contents immediately.
    state.sync.tick(&target.id, FsPath::new(&target.openclaw_dir));

    // Fleet evaluation + alerting rides on check-ins.
    if state.config.fleet.enabled
        && let Some(status) = state.evaluate_one(&target.id)
    {
        let alerts = alerts_from_status(&status);
        if !alerts.is_empty() {
            let router = state.alerts.clone();
            tokio::spawn(async move {
                for alert in alerts {
                    router.route(&alert).await;
                }
            });
        }
        state.sse.publish("fleet.status", &status);
    }

    state.journal.succeed(op);
    let run_delta_jobs = applied.run_delta_jobs;
    Ok(Json(BridgeCronSyncResponse {
        ok: true,
        target_id: target.id,
        jobs_applied: applied.jobs_applied,
        config_applied: applied.config_applied,
        run_delta_jobs,
    })
    .into_response())
}

// ─── Pull-model command lifecycle ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollBody {
    pub machine_id: String,
    pub lease_ttl_ms: Option<u64>,
}

pub async fn poll(
    State(state): State<SharedState>,
    Json(body): Json<PollBody>,
) -> Result<Json<Value>, HttpError> {
    if !patze_proto::validate_id(&body.machine_id) {
        return Err(bad_request("invalid machineId"));
    }
    match state.commands.poll(&body.machine_id, body.lease_ttl_ms) {
        Some(command) => Ok(Json(json!({"available": true, "command": command}))),
        None => Ok(Json(json!({"available": false}))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBody {
    pub machine_id: String,
}

pub async fn ack(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<AckBody>,
) -> Result<Json<BridgeCommand>, HttpError> {
    state
        .commands
        .ack(&id, &body.machine_id)
        .map(Json)
        .map_err(map_command_error)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub machine_id: String,
    pub lease_ttl_ms: Option<u64>,
}

pub async fn heartbeat(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<BridgeCommand>, HttpError> {
    state
        .commands
        .heartbeat(&id, &body.machine_id, body.lease_ttl_ms)
        .map(Json)
        .map_err(map_command_error)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBody {
    pub machine_id: String,
    pub result: CommandResultPayload,
}

pub async fn result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ResultBody>,
) -> Result<Json<Value>, HttpError> {
    let outcome = state
        .commands
        .result(&id, &body.machine_id, body.result)
        .map_err(map_command_error)?;
    state.sse.publish("command.result", &outcome.command);
    Ok(Json(json!({
        "command": outcome.command,
        "duplicate": outcome.duplicate,
    })))
}

// ─── Operator side ────────────────────────────────────────────────────────────

pub async fn enqueue(
    State(state): State<SharedState>,
    Json(mut request): Json<EnqueueRequest>,
) -> Result<Json<BridgeCommand>, HttpError> {
    let target = state
        .targets
        .get(&request.target_id)
        .ok_or_else(|| HttpError(ApiError::new(ErrorCode::TargetNotFound)))?;
    // The enqueue snapshot pins the config hash the operator was seeing.
    request.target_version = patze_sync::current_config_hash(FsPath::new(&target.openclaw_dir));

    let op = state.journal.begin("command.enqueue");
    let command = state.commands.enqueue(request);
    state.journal.succeed(op);
    Ok(Json(command))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    pub approver: String,
    pub target_version: String,
}

pub async fn approve(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<BridgeCommand>, HttpError> {
    let command = state
        .commands
        .get(&id)
        .ok_or_else(|| HttpError(ApiError::with_message(ErrorCode::NotFound, "unknown command")))?;
    let current = state
        .target_config_hash(&command.snapshot.target_id)
        .ok_or_else(|| HttpError(ApiError::new(ErrorCode::TargetNotFound)))?;

    let op = state.journal.begin("command.approve");
    match state.commands.approve(&id, &body.approver, &body.target_version, &current) {
        Ok(command) => {
            state.journal.succeed(op);
            Ok(Json(command))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_command_error(e))
        }
    }
}

#[derive(Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

pub async fn reject(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<BridgeCommand>, HttpError> {
    state
        .commands
        .reject(&id, &body.reason)
        .map(Json)
        .map_err(map_command_error)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub target_id: Option<String>,
}

pub async fn list_commands(
    State(state): State<SharedState>,
    axum::extract::Query(query): axum::extract::Query<ListQuery>,
) -> Json<Vec<BridgeCommand>> {
    Json(state.commands.list(query.target_id.as_deref()))
}

pub async fn get_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BridgeCommand>, HttpError> {
    state
        .commands
        .get(&id)
        .map(Json)
        .ok_or_else(|| HttpError(ApiError::with_message(ErrorCode::NotFound, "unknown command")))
}
