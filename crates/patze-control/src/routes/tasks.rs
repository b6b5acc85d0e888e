//! Scheduled task CRUD, manual runs, and task-set snapshots.

use crate::error::{HttpError, bad_request};
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, Query, State};
use patze_cron::{CronError, NewTask, TaskSetSnapshot};
use patze_proto::{ApiError, ErrorCode, ScheduledTask, TaskRunRecord};
use serde::Deserialize;
use serde_json::{Value, json};

fn map_cron_error(e: CronError) -> HttpError {
    match e {
        CronError::TaskNotFound(id) => {
            HttpError(ApiError::with_message(ErrorCode::NotFound, format!("task '{id}'")))
        }
        CronError::SnapshotNotFound(id) => {
            HttpError(ApiError::with_message(ErrorCode::SnapshotNotFound, format!("snapshot '{id}'")))
        }
        CronError::Schedule(e) => bad_request(e.to_string()),
    }
}

pub async fn list(State(state): State<SharedState>) -> Json<Vec<ScheduledTask>> {
    Json(state.cron.list_tasks())
}

pub async fn create(
    State(state): State<SharedState>,
    Json(new): Json<NewTask>,
) -> Result<Json<ScheduledTask>, HttpError> {
    state.cron.create_task(new).map(Json).map_err(map_cron_error)
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, HttpError> {
    state
        .cron
        .get_task(&id)
        .map(Json)
        .ok_or_else(|| map_cron_error(CronError::TaskNotFound(id)))
}

pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(new): Json<NewTask>,
) -> Result<Json<ScheduledTask>, HttpError> {
    state.cron.update_task(&id, new).map(Json).map_err(map_cron_error)
}

pub async fn remove(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    state.cron.delete_task(&id).map_err(map_cron_error)?;
    Ok(Json(json!({"ok": true})))
}

pub async fn run_now(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let op = state.journal.begin("task.run");
    match state.cron.run_task(&id).await {
        Ok(execution) => {
            if execution.ok {
                state.journal.succeed(op);
            } else {
                state.journal.fail(op, execution.summary.clone());
            }
            Ok(Json(json!({"ok": execution.ok, "summary": execution.summary})))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_cron_error(e))
        }
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<TaskRunRecord>> {
    Json(state.cron.run_history(&id, query.limit))
}

pub async fn snapshots(State(state): State<SharedState>) -> Json<Vec<TaskSetSnapshot>> {
    Json(state.cron.list_task_snapshots())
}

pub async fn rollback(
    State(state): State<SharedState>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let restored = state
        .cron
        .rollback_tasks(&snapshot_id)
        .map_err(map_cron_error)?;
    Ok(Json(json!({"restored": restored})))
}
