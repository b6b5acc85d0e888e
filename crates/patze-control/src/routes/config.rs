//! Config command queue endpoints.

use crate::error::HttpError;
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, State};
use patze_apply::{ApplyError, ApplyResult, PreviewResult};
use patze_proto::{ApiError, CliInvocation, ConfigSnapshot, ErrorCode};
use serde::Deserialize;
use serde_json::{Value, json};

fn map_apply_error(e: ApplyError) -> HttpError {
    let error = match &e {
        ApplyError::TargetNotFound(id) => {
            ApiError::with_message(ErrorCode::TargetNotFound, format!("target '{id}'"))
        }
        ApplyError::SnapshotNotFound(id) => {
            ApiError::with_message(ErrorCode::SnapshotNotFound, format!("snapshot '{id}'"))
        }
        ApplyError::CommandBlocked(detail) => {
            ApiError::with_message(ErrorCode::CommandBlocked, detail.clone())
        }
        ApplyError::Sandbox(_) | ApplyError::Io(_) => ApiError::new(ErrorCode::InternalServerError),
    };
    HttpError(error)
}

pub async fn queue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(invocation): Json<CliInvocation>,
) -> Result<Json<Value>, HttpError> {
    let depth = state
        .apply
        .queue_command(&id, invocation)
        .map_err(map_apply_error)?;
    Ok(Json(json!({"queued": depth})))
}

pub async fn pending(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<Vec<CliInvocation>> {
    Json(state.apply.pending(&id))
}

pub async fn clear(State(state): State<SharedState>, Path(id): Path<String>) -> Json<Value> {
    state.apply.clear_pending(&id);
    Json(json!({"ok": true}))
}

pub async fn preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<PreviewResult>, HttpError> {
    state.apply.preview(&id).await.map(Json).map_err(map_apply_error)
}

#[derive(Deserialize)]
pub struct ApplyBody {
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "operator".to_string()
}

pub async fn apply(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ApplyBody>,
) -> Result<Json<ApplyResult>, HttpError> {
    let op = state.journal.begin("config.apply");
    match state.apply.apply(&id, &body.source).await {
        Ok(result) => {
            if result.ok {
                state.journal.succeed(op);
            } else {
                state
                    .journal
                    .fail(op, result.error.clone().unwrap_or_default());
            }
            state.sse.publish("config.applied", &result);
            Ok(Json(result))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_apply_error(e))
        }
    }
}

pub async fn list_snapshots(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<Vec<ConfigSnapshot>> {
    Json(state.apply.list_snapshots(&id))
}

pub async fn get_snapshot(
    State(state): State<SharedState>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<ConfigSnapshot>, HttpError> {
    state
        .apply
        .get_snapshot(&snapshot_id)
        .map(Json)
        .ok_or_else(|| map_apply_error(ApplyError::SnapshotNotFound(snapshot_id)))
}

pub async fn rollback(
    State(state): State<SharedState>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<ConfigSnapshot>, HttpError> {
    let op = state.journal.begin("config.rollback");
    match state.apply.rollback_to_snapshot(&snapshot_id) {
        Ok(snapshot) => {
            state.journal.succeed(op);
            Ok(Json(snapshot))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_apply_error(e))
        }
    }
}
