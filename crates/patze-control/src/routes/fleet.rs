//! Fleet status, policies, batch apply, and alert configuration.

use crate::error::{HttpError, bad_request};
use crate::state::SharedState;
use axum::Json;
use axum::http::StatusCode;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use patze_fleet::{
    AlertDestination, AlertRule, ApprovalError, BatchApplyRequest, BatchOutcome, EvaluationInput,
    NewPolicyProfile, PolicyError, evaluate_target,
};
use patze_proto::{ApiError, ErrorCode, FleetPolicyProfile, FleetTargetStatus};
use serde::Deserialize;
use serde_json::{Value, json};

fn fleet_enabled(state: &SharedState) -> Result<(), HttpError> {
    if state.config.fleet.enabled {
        Ok(())
    } else {
        Err(HttpError(ApiError::new(ErrorCode::SmartFleetDisabled)))
    }
}

fn map_approval_error(e: ApprovalError) -> HttpError {
    let error = match &e {
        ApprovalError::NotFound => ApiError::new(ErrorCode::ApprovalNotFound),
        ApprovalError::Expired => ApiError::new(ErrorCode::ApprovalExpired),
        ApprovalError::SignatureMismatch => ApiError::new(ErrorCode::ApprovalSignatureMismatch),
        ApprovalError::EmptyBatch => return bad_request("batch contains no items"),
        ApprovalError::Policy(PolicyError::NotFound(id)) => {
            ApiError::with_message(ErrorCode::NotFound, format!("policy '{id}'"))
        }
        ApprovalError::Policy(PolicyError::DefaultImmutable) => {
            return bad_request("the default profile cannot be removed");
        }
    };
    HttpError(error)
}

pub async fn status_all(State(state): State<SharedState>) -> Result<Json<Vec<FleetTargetStatus>>, HttpError> {
    fleet_enabled(&state)?;
    Ok(Json(state.evaluate_fleet()))
}

pub async fn status_one(
    State(state): State<SharedState>,
    Path(target_id): Path<String>,
) -> Result<Json<FleetTargetStatus>, HttpError> {
    fleet_enabled(&state)?;
    state
        .evaluate_one(&target_id)
        .map(Json)
        .ok_or_else(|| HttpError(ApiError::with_message(ErrorCode::TargetNotFound, "not fleet-managed")))
}

pub async fn list_policies(State(state): State<SharedState>) -> Json<Vec<FleetPolicyProfile>> {
    Json(state.policies.list_profiles())
}

pub async fn create_policy(
    State(state): State<SharedState>,
    Json(new): Json<NewPolicyProfile>,
) -> Json<FleetPolicyProfile> {
    Json(state.policies.create_profile(new))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub target_id: String,
    pub policy_id: String,
}

pub async fn assign_policy(
    State(state): State<SharedState>,
    Json(body): Json<AssignBody>,
) -> Result<Json<Value>, HttpError> {
    state
        .policies
        .assign(&body.target_id, &body.policy_id)
        .map_err(|e| map_approval_error(ApprovalError::Policy(e)))?;
    Ok(Json(json!({"ok": true})))
}

/// Batch policy apply with the critical-change approval gate. Over the
/// threshold without a token, this returns `409 approval_required` with a
/// single-use token bound to exactly this batch.
pub async fn batch_apply(
    State(state): State<SharedState>,
    Json(request): Json<BatchApplyRequest>,
) -> Result<Response, HttpError> {
    fleet_enabled(&state)?;
    let op = state.journal.begin("fleet.batch_apply");

    let preview = |item: &patze_fleet::BatchApplyItem| -> Option<FleetTargetStatus> {
        let target = state.targets.get(&item.target_id)?;
        if !patze_fleet::is_fleet_managed(&target) {
            return None;
        }
        let policy = state.policies.get_profile(&item.policy_id)?;
        let check_in = state.sync.get_check_in(&target.id);
        let sync_status = state.sync.get_status(&target.id);
        let local_hash =
            patze_sync::current_config_hash(std::path::Path::new(&target.openclaw_dir));
        Some(evaluate_target(EvaluationInput {
            target: &target,
            policy: &policy,
            check_in: check_in.as_ref(),
            sync_status: sync_status.as_ref(),
            local_config_hash: local_hash,
            actual_auth_mode: state.auth.proto_mode(),
            now: Utc::now(),
        }))
    };

    match patze_fleet::batch_apply(&request, &state.policies, &state.approvals, preview) {
        Ok(BatchOutcome::Applied { summary }) => {
            state.journal.succeed(op);
            Ok(Json(json!({"summary": summary})).into_response())
        }
        Ok(BatchOutcome::ApprovalRequired { token, expires_at }) => {
            state.journal.fail(op, "approval required");
            Ok((
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "approval_required",
                    "approval": {"token": token, "expiresAt": expires_at},
                })),
            )
                .into_response())
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_approval_error(e))
        }
    }
}

// ─── Alert configuration ──────────────────────────────────────────────────────

pub async fn alert_config(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "destinations": state.alerts.list_destinations(),
        "rules": state.alerts.list_rules(),
    }))
}

pub async fn upsert_destination(
    State(state): State<SharedState>,
    Json(destination): Json<AlertDestination>,
) -> Json<Value> {
    state.alerts.upsert_destination(destination);
    Json(json!({"ok": true}))
}

pub async fn remove_destination(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<Value> {
    state.alerts.remove_destination(&id);
    Json(json!({"ok": true}))
}

pub async fn upsert_rule(
    State(state): State<SharedState>,
    Json(rule): Json<AlertRule>,
) -> Json<Value> {
    state.alerts.upsert_rule(rule);
    Json(json!({"ok": true}))
}

pub async fn remove_rule(State(state): State<SharedState>, Path(id): Path<String>) -> Json<Value> {
    state.alerts.remove_rule(&id);
    Json(json!({"ok": true}))
}
