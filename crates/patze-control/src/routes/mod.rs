//! Route table for the control surface.

mod attach;
mod bridge;
mod config;
mod fleet;
mod misc;
mod setup;
mod targets;
mod tasks;
mod telemetry;

use crate::auth::require_auth;
use crate::state::SharedState;
use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};

pub fn build_router(state: SharedState) -> Router {
    let guarded = Router::new()
        // Telemetry ingest + unified snapshot
        .route("/telemetry/events", post(telemetry::ingest))
        .route("/telemetry/snapshot", get(telemetry::snapshot))
        .route("/telemetry/stream", get(telemetry::stream))
        // OpenClaw targets & sync
        .route("/openclaw/targets", get(targets::list).post(targets::create))
        .route(
            "/openclaw/targets/{id}",
            get(targets::get_one).patch(targets::update).delete(targets::remove),
        )
        .route("/openclaw/targets/{id}/sync/start", post(targets::sync_start))
        .route("/openclaw/targets/{id}/sync/stop", post(targets::sync_stop))
        .route("/openclaw/targets/{id}/sync/restart", post(targets::sync_restart))
        .route("/openclaw/targets/{id}/status", get(targets::status))
        .route("/openclaw/targets/status", get(targets::all_statuses))
        .route("/openclaw/targets/{id}/jobs", get(targets::jobs))
        .route("/openclaw/targets/{id}/jobs/{job_id}/runs", get(targets::run_history))
        .route("/openclaw/targets/{id}/schedule", get(targets::merged_schedule))
        // Bridge check-in + pull-model command lifecycle
        .route("/openclaw/bridge/cron-sync", post(bridge::cron_sync))
        .route("/openclaw/bridge/commands/poll", post(bridge::poll))
        .route("/openclaw/bridge/commands/{id}/ack", post(bridge::ack))
        .route("/openclaw/bridge/commands/{id}/heartbeat", post(bridge::heartbeat))
        .route("/openclaw/bridge/commands/{id}/result", post(bridge::result))
        // Operator command management
        .route("/openclaw/commands", get(bridge::list_commands).post(bridge::enqueue))
        .route("/openclaw/commands/{id}", get(bridge::get_command))
        .route("/openclaw/commands/{id}/approve", post(bridge::approve))
        .route("/openclaw/commands/{id}/reject", post(bridge::reject))
        // Config command queue
        .route(
            "/openclaw/targets/{id}/config/queue",
            get(config::pending).post(config::queue).delete(config::clear),
        )
        .route("/openclaw/targets/{id}/config/preview", post(config::preview))
        .route("/openclaw/targets/{id}/config/apply", post(config::apply))
        .route("/openclaw/targets/{id}/config/snapshots", get(config::list_snapshots))
        .route("/openclaw/config/snapshots/{snapshot_id}", get(config::get_snapshot))
        .route(
            "/openclaw/config/snapshots/{snapshot_id}/rollback",
            post(config::rollback),
        )
        // Fleet
        .route("/fleet/status", get(fleet::status_all))
        .route("/fleet/status/{target_id}", get(fleet::status_one))
        .route("/fleet/policies", get(fleet::list_policies).post(fleet::create_policy))
        .route("/fleet/policies/assign", post(fleet::assign_policy))
        .route("/fleet/policies/batch-apply", post(fleet::batch_apply))
        .route("/fleet/alerts", get(fleet::alert_config))
        .route("/fleet/alerts/destinations", post(fleet::upsert_destination))
        .route("/fleet/alerts/destinations/{id}", delete(fleet::remove_destination))
        .route("/fleet/alerts/rules", post(fleet::upsert_rule))
        .route("/fleet/alerts/rules/{id}", delete(fleet::remove_rule))
        // Scheduled tasks
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/tasks/{id}",
            get(tasks::get_one).put(tasks::update).delete(tasks::remove),
        )
        .route("/tasks/{id}/run", post(tasks::run_now))
        .route("/tasks/{id}/history", get(tasks::history))
        .route("/tasks/snapshots/list", get(tasks::snapshots))
        .route("/tasks/snapshots/{snapshot_id}/rollback", post(tasks::rollback))
        // Attachments & tunnels
        .route("/attachments", get(attach::list).post(attach::attach))
        .route("/attachments/{id}", delete(attach::detach))
        .route("/attachments/{id}/probe", post(attach::probe))
        .route("/tunnels", get(attach::tunnels))
        .route("/tunnels/{id}", delete(attach::close_tunnel))
        // Bridge installs
        .route("/bridges/preflight", post(setup::preflight))
        .route("/bridges/setup", post(setup::setup))
        .route("/bridges", get(setup::list))
        .route("/bridges/{id}", get(setup::get_one))
        .route("/bridges/{id}/sudo-password", post(setup::sudo_password))
        .route("/bridges/{id}/retry-user-mode", post(setup::retry_user_mode))
        // Operator conveniences
        .route("/journal", get(misc::journal))
        .route("/ssh-connections", get(misc::list_ssh).post(misc::add_ssh))
        .route("/ssh-connections/{id}", delete(misc::remove_ssh))
        .layer(from_fn_with_state(state.auth.clone(), require_auth))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(misc::health))
        .with_state(state)
        .merge(guarded)
}
