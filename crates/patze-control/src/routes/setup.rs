//! Bridge install endpoints.

use crate::error::{HttpError, bad_request};
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, State};
use patze_bridge::{BridgeView, ManagedBridgeError, PreflightReport, SetupInput};
use patze_proto::{ApiError, ErrorCode};
use serde::Deserialize;
use tracing::warn;

/// Wire shape for preflight/setup: artifact contents come from local paths
/// rather than inline bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub label: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
    #[serde(default)]
    pub trust_on_first_use: bool,
    #[serde(default)]
    pub remote_dir: Option<String>,
    #[serde(default)]
    pub bundle_path: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl SetupRequest {
    fn into_input(self) -> Result<SetupInput, HttpError> {
        let bundle = match &self.bundle_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                warn!(error = %e, "bundle unreadable");
                bad_request("bundle file is not readable")
            })?,
            None => Vec::new(),
        };
        let config = match &self.config_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                warn!(error = %e, "bridge config unreadable");
                bad_request("config file is not readable")
            })?,
            None => Vec::new(),
        };

        let mut input = SetupInput {
            label: self.label,
            host: self.host,
            port: self.port,
            user: self.user,
            private_key_path: self.private_key_path,
            trust_on_first_use: self.trust_on_first_use,
            remote_dir: String::new(),
            bundle,
            config,
        };
        input.remote_dir = self
            .remote_dir
            .unwrap_or_else(|| "/opt/openclaw-bridge".to_string());
        Ok(input)
    }
}

fn map_bridge_error(e: ManagedBridgeError) -> HttpError {
    match e {
        ManagedBridgeError::NotFound(id) => {
            HttpError(ApiError::with_message(ErrorCode::NotFound, format!("bridge '{id}'")))
        }
        ManagedBridgeError::NotAwaitingPassword(_) => HttpError(ApiError::with_message(
            ErrorCode::InvalidTransition,
            "bridge is not waiting for a sudo password",
        )),
    }
}

pub async fn preflight(
    State(state): State<SharedState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<PreflightReport>, HttpError> {
    let input = request.into_input()?;
    Ok(Json(state.bridge_setup.preflight(&input).await))
}

pub async fn setup(
    State(state): State<SharedState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<BridgeView>, HttpError> {
    let input = request.into_input()?;
    let op = state.journal.begin("bridge.setup");
    let view = state.bridge_setup.setup(input).await;
    match view.state {
        patze_bridge::BridgeState::Error => state.journal.fail(op, "install failed"),
        _ => state.journal.succeed(op),
    }
    state.sse.publish("bridge.setup", &view);
    Ok(Json(view))
}

pub async fn list(State(state): State<SharedState>) -> Json<Vec<BridgeView>> {
    Json(state.bridge_setup.list())
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BridgeView>, HttpError> {
    state
        .bridge_setup
        .get(&id)
        .map(Json)
        .ok_or_else(|| map_bridge_error(ManagedBridgeError::NotFound(id)))
}

#[derive(Deserialize)]
pub struct SudoPasswordBody {
    pub password: String,
}

pub async fn sudo_password(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<SudoPasswordBody>,
) -> Result<Json<BridgeView>, HttpError> {
    state
        .bridge_setup
        .retry_install_with_sudo_password(&id, &body.password)
        .await
        .map(Json)
        .map_err(map_bridge_error)
}

pub async fn retry_user_mode(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BridgeView>, HttpError> {
    state
        .bridge_setup
        .retry_install_user_mode(&id)
        .await
        .map(Json)
        .map_err(map_bridge_error)
}
