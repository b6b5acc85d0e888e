//! Attachment and tunnel endpoints.

use crate::error::HttpError;
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, Query, State};
use patze_attach::{AttachError, AttachmentInfo, EndpointConfig};
use patze_proto::{ApiError, ErrorCode};
use patze_tunnel::TunnelInfo;
use serde::Deserialize;
use serde_json::{Value, json};

fn map_attach_error(e: AttachError) -> HttpError {
    let error = match &e {
        AttachError::AlreadyAttached(id) => {
            ApiError::with_message(ErrorCode::InvalidTransition, format!("endpoint '{id}' attached"))
        }
        AttachError::NotFound(id) => {
            ApiError::with_message(ErrorCode::NotFound, format!("attachment '{id}'"))
        }
        AttachError::HealthCheckFailed => {
            ApiError::with_message(ErrorCode::PreflightFailed, "health probe never passed")
        }
        AttachError::Tunnel(e) => {
            ApiError::with_message(ErrorCode::PreflightFailed, e.to_string())
        }
    };
    HttpError(error)
}

pub async fn list(State(state): State<SharedState>) -> Json<Vec<AttachmentInfo>> {
    Json(state.attachments.list_attachments())
}

pub async fn attach(
    State(state): State<SharedState>,
    Json(config): Json<EndpointConfig>,
) -> Result<Json<AttachmentInfo>, HttpError> {
    let op = state.journal.begin("endpoint.attach");
    match state.attachments.attach_endpoint(config).await {
        Ok(info) => {
            state.journal.succeed(op);
            state.sse.publish("attachment", &info);
            Ok(Json(info))
        }
        Err(e) => {
            state.journal.fail(op, e.to_string());
            Err(map_attach_error(e))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachQuery {
    #[serde(default = "default_close_tunnel")]
    pub close_tunnel: bool,
}

fn default_close_tunnel() -> bool {
    true
}

pub async fn detach(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<DetachQuery>,
) -> Json<Value> {
    state.attachments.detach_endpoint(&id, query.close_tunnel);
    Json(json!({"ok": true}))
}

pub async fn probe(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let health = state.attachments.probe(&id).await.map_err(map_attach_error)?;
    Ok(Json(json!({"health": health})))
}

pub async fn tunnels(State(state): State<SharedState>) -> Json<Vec<TunnelInfo>> {
    Json(state.tunnels.list_tunnels())
}

pub async fn close_tunnel(State(state): State<SharedState>, Path(id): Path<String>) -> Json<Value> {
    state.tunnels.close(&id);
    Json(json!({"ok": true}))
}
