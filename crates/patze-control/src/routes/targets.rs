//! Target CRUD and per-target sync control.

use crate::error::{HttpError, bad_request};
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, Query, State};
use patze_proto::{ApiError, ErrorCode, OpenClawCronJob, OpenClawSyncStatus, OpenClawTarget};
use patze_sync::{NewTarget, TargetError, TargetPatch};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

fn map_target_error(e: TargetError) -> HttpError {
    match e {
        TargetError::NotFound(id) => {
            HttpError(ApiError::with_message(ErrorCode::TargetNotFound, format!("target '{id}'")))
        }
        TargetError::SmokeMustBeTest => bad_request("smoke targets must have purpose=test"),
        TargetError::UnsafeDir(e) => bad_request(e.to_string()),
    }
}

pub async fn list(State(state): State<SharedState>) -> Json<Vec<OpenClawTarget>> {
    Json(state.targets.list())
}

pub async fn create(
    State(state): State<SharedState>,
    Json(new): Json<NewTarget>,
) -> Result<Json<OpenClawTarget>, HttpError> {
    let op = state.journal.begin("target.create");
    match state.targets.create(new) {
        Ok(target) => {
            if target.enabled {
                state.sync.start_target(&target.id);
            }
            state.journal.succeed(op);
            Ok(Json(target))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_target_error(e))
        }
    }
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<OpenClawTarget>, HttpError> {
    state
        .targets
        .get(&id)
        .map(Json)
        .ok_or_else(|| map_target_error(TargetError::NotFound(id)))
}

pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(patch): Json<TargetPatch>,
) -> Result<Json<OpenClawTarget>, HttpError> {
    let op = state.journal.begin("target.update");
    let enabled_change = patch.enabled;
    match state.targets.update(&id, patch) {
        Ok(target) => {
            match enabled_change {
                Some(true) => state.sync.start_target(&target.id),
                Some(false) => state.sync.stop_target(&target.id).await,
                None => {}
            }
            state.journal.succeed(op);
            Ok(Json(target))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_target_error(e))
        }
    }
}

pub async fn remove(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let op = state.journal.begin("target.remove");
    state.sync.stop_target(&id).await;
    match state.targets.remove(&id) {
        Ok(removed) => {
            state.journal.succeed(op);
            Ok(Json(json!({"removed": removed.id})))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_target_error(e))
        }
    }
}

pub async fn sync_start(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    require_target(&state, &id)?;
    state.sync.start_target(&id);
    Ok(Json(json!({"ok": true})))
}

pub async fn sync_stop(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    require_target(&state, &id)?;
    state.sync.stop_target(&id).await;
    Ok(Json(json!({"ok": true})))
}

pub async fn sync_restart(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    require_target(&state, &id)?;
    state.sync.restart_target(&id).await;
    Ok(Json(json!({"ok": true})))
}

pub async fn status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<OpenClawSyncStatus>, HttpError> {
    require_target(&state, &id)?;
    state
        .sync
        .get_status(&id)
        .map(Json)
        .ok_or_else(|| HttpError(ApiError::with_message(ErrorCode::NotFound, "no sync state yet")))
}

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub deduped: bool,
}

pub async fn all_statuses(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> Json<HashMap<String, OpenClawSyncStatus>> {
    if query.deduped {
        let online = state.sync.online_machine_ids(state.config.heartbeat_timeout_ms);
        Json(state.sync.get_deduped_statuses(&online))
    } else {
        Json(state.sync.get_all_statuses())
    }
}

pub async fn jobs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OpenClawCronJob>>, HttpError> {
    require_target(&state, &id)?;
    Ok(Json(state.sync.get_jobs(&id)))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn run_history(
    State(state): State<SharedState>,
    Path((id, job_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, HttpError> {
    require_target(&state, &id)?;
    let runs = state.sync.get_run_history(&id, &job_id, query.limit);
    Ok(Json(json!({"jobId": job_id, "runs": runs})))
}

pub async fn merged_schedule(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    require_target(&state, &id)?;
    let tasks = state.cron.list_tasks();
    let view = state.sync.create_merged_view(&id, &tasks);
    Ok(Json(json!({"targetId": id, "entries": view})))
}

fn require_target(state: &SharedState, id: &str) -> Result<OpenClawTarget, HttpError> {
    state
        .targets
        .get(id)
        .ok_or_else(|| map_target_error(TargetError::NotFound(id.to_string())))
}
