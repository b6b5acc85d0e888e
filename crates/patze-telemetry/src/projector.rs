//! Deterministic fold of telemetry events into machine/session/run read
//! models.
//!
//! The fold is last-writer-wins per field, with one hard rule: a run that
//! has reached a terminal state ignores every later event for its id.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use patze_proto::{EventKind, MachineView, RunState, RunView, SessionView, TelemetryEvent};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModels {
    pub machines: HashMap<String, MachineView>,
    pub sessions: HashMap<String, SessionView>,
    pub runs: HashMap<String, RunView>,
}

/// Fold one event into the read models. Never panics: malformed payload
/// fields degrade to defaults instead of failing the fold.
pub fn fold_event(models: &mut ReadModels, event: &TelemetryEvent) {
    touch_machine(models, event);

    match event.kind {
        EventKind::MachineRegistered | EventKind::MachineHeartbeat => {}
        EventKind::SessionStarted | EventKind::SessionUpdated | EventKind::SessionEnded => {
            fold_session(models, event);
        }
        EventKind::RunStarted
        | EventKind::RunUpdated
        | EventKind::RunCompleted
        | EventKind::RunFailed
        | EventKind::RunCancelled
        | EventKind::ToolInvoked
        | EventKind::ToolCompleted => {
            fold_run(models, event);
        }
        EventKind::LogEmitted | EventKind::SpanStarted | EventKind::SpanEnded => {}
    }
}

fn touch_machine(models: &mut ReadModels, event: &TelemetryEvent) {
    let machine = models
        .machines
        .entry(event.machine_id.clone())
        .or_insert_with(|| MachineView {
            machine_id: event.machine_id.clone(),
            label: None,
            bridge_version: None,
            registered_at: event.ts,
            last_heartbeat_at: event.ts,
            event_count: 0,
        });

    machine.event_count += 1;
    if event.ts > machine.last_heartbeat_at {
        machine.last_heartbeat_at = event.ts;
    }

    if event.kind == EventKind::MachineRegistered {
        if let Some(label) = payload_str(event, "label") {
            machine.label = Some(label);
        }
        if let Some(version) = payload_str(event, "bridgeVersion") {
            machine.bridge_version = Some(version);
        }
    }
}

fn fold_session(models: &mut ReadModels, event: &TelemetryEvent) {
    let Some(session_id) = payload_str(event, "sessionId") else {
        return;
    };

    let session = models
        .sessions
        .entry(session_id.clone())
        .or_insert_with(|| SessionView {
            session_id: session_id.clone(),
            machine_id: event.machine_id.clone(),
            state: RunState::Created,
            title: None,
            started_at: event.ts,
            updated_at: event.ts,
            ended_at: None,
        });

    if session.state.is_terminal() {
        return;
    }
    session.updated_at = lww(session.updated_at, event.ts);

    match event.kind {
        EventKind::SessionStarted => {
            session.started_at = event.ts;
            session.state = payload_state(event).unwrap_or(RunState::Running);
        }
        EventKind::SessionUpdated => {
            if let Some(state) = payload_state(event) {
                session.state = state;
            }
        }
        EventKind::SessionEnded => {
            let state = payload_state(event).filter(RunState::is_terminal);
            session.state = state.unwrap_or(RunState::Completed);
            session.ended_at = Some(event.ts);
        }
        _ => {}
    }
    if let Some(title) = payload_str(event, "title") {
        session.title = Some(title);
    }
}

fn fold_run(models: &mut ReadModels, event: &TelemetryEvent) {
    let Some(run_id) = payload_str(event, "runId") else {
        return;
    };

    let run = models.runs.entry(run_id.clone()).or_insert_with(|| RunView {
        run_id: run_id.clone(),
        session_id: payload_str(event, "sessionId").unwrap_or_default(),
        machine_id: event.machine_id.clone(),
        state: RunState::Created,
        started_at: event.ts,
        updated_at: event.ts,
        error: None,
        tool_invocations: 0,
    });

    // Terminal runs are frozen: later events for the id are discarded.
    if run.state.is_terminal() {
        return;
    }
    run.updated_at = lww(run.updated_at, event.ts);
    if run.session_id.is_empty() {
        if let Some(session_id) = payload_str(event, "sessionId") {
            run.session_id = session_id;
        }
    }

    match event.kind {
        EventKind::RunStarted => {
            run.started_at = event.ts;
            run.state = payload_state(event).unwrap_or(RunState::Running);
        }
        EventKind::RunUpdated => {
            if let Some(state) = payload_state(event) {
                run.state = state;
            }
            if let Some(error) = payload_str(event, "error") {
                run.error = Some(error);
            }
        }
        EventKind::RunCompleted => run.state = RunState::Completed,
        EventKind::RunFailed => {
            run.state = RunState::Failed;
            run.error = payload_str(event, "error").or(run.error.take());
        }
        EventKind::RunCancelled => run.state = RunState::Cancelled,
        EventKind::ToolInvoked => {
            run.tool_invocations += 1;
            run.state = RunState::WaitingTool;
        }
        EventKind::ToolCompleted => {
            if run.state == RunState::WaitingTool {
                run.state = RunState::Running;
            }
        }
        _ => {}
    }
}

fn payload_str(event: &TelemetryEvent, field: &str) -> Option<String> {
    event
        .payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn payload_state(event: &TelemetryEvent) -> Option<RunState> {
    event
        .payload
        .get("state")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

fn lww(current: DateTime<Utc>, incoming: DateTime<Utc>) -> DateTime<Utc> {
    current.max(incoming)
}

/// Read-model holder bound to one event store via a subscription.
pub struct Projector {
    models: RwLock<ReadModels>,
}

impl Projector {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(ReadModels::default()),
        }
    }

    pub fn apply(&self, event: &TelemetryEvent) {
        fold_event(&mut self.models.write(), event);
    }

    /// Snapshot copy for reads that cross an await point.
    pub fn snapshot(&self) -> ReadModels {
        self.models.read().clone()
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new()
    }
}
