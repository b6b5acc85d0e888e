//! Telemetry ingest, unified snapshot, and the SSE stream.

use crate::error::{HttpError, bad_request};
use crate::state::SharedState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use patze_telemetry::IngestOutcome;
use serde_json::{Value, json};

fn outcome_json(outcome: &IngestOutcome) -> Value {
    match outcome {
        IngestOutcome::Ok { event } => json!({"ok": true, "event": event}),
        IngestOutcome::Error { code, message } => {
            json!({"ok": false, "error": code, "message": message})
        }
    }
}

/// Accepts one event object or an array of them; arrays return per-index
/// results. Accepted events fan out over SSE.
pub async fn ingest(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    match body {
        Value::Array(items) => {
            let outcomes = state.local_node.ingest_many(&items);
            for outcome in &outcomes {
                if let IngestOutcome::Ok { event } = outcome {
                    state.sse.publish("telemetry", event);
                }
            }
            let results: Vec<Value> = outcomes.iter().map(outcome_json).collect();
            Ok(Json(json!({"results": results})))
        }
        Value::Object(_) => {
            let outcome = state.local_node.ingest(&body);
            if let IngestOutcome::Ok { event } = &outcome {
                state.sse.publish("telemetry", event);
            }
            Ok(Json(outcome_json(&outcome)))
        }
        _ => Err(bad_request("expected an event object or an array of events")),
    }
}

pub async fn snapshot(State(state): State<SharedState>) -> Json<Value> {
    let snapshot = state.aggregator.snapshot();
    Json(serde_json::to_value(&*snapshot).unwrap_or(Value::Null))
}

pub async fn stream(State(state): State<SharedState>) -> impl IntoResponse {
    state.sse.stream()
}
