//! Liveness, journal, and SSH connection endpoints.

use crate::error::{HttpError, bad_request};
use crate::journal::JournalEntry;
use crate::settings::{NewSshConnection, SshConnection};
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, Query, State};
use patze_proto::{ApiError, ErrorCode};
use serde::Deserialize;
use serde_json::{Value, json};

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "patze-control",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": state.aggregator.attached_nodes().len(),
    }))
}

#[derive(Deserialize)]
pub struct JournalQuery {
    pub limit: Option<usize>,
}

pub async fn journal(
    State(state): State<SharedState>,
    Query(query): Query<JournalQuery>,
) -> Json<Vec<JournalEntry>> {
    Json(state.journal.entries(query.limit))
}

pub async fn list_ssh(State(state): State<SharedState>) -> Json<Vec<SshConnection>> {
    Json(state.ssh_connections.list())
}

pub async fn add_ssh(
    State(state): State<SharedState>,
    Json(new): Json<NewSshConnection>,
) -> Result<Json<SshConnection>, HttpError> {
    state
        .ssh_connections
        .add(new)
        .map(Json)
        .map_err(|e| bad_request(e.to_string()))
}

pub async fn remove_ssh(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    if state.ssh_connections.remove(&id) {
        Ok(Json(json!({"ok": true})))
    } else {
        Err(HttpError(ApiError::with_message(
            ErrorCode::NotFound,
            "unknown ssh connection",
        )))
    }
}
