//! Telemetry ingestion for one node: validating ingestor, append-only event
//! store with synchronous fan-out, and a projector that folds the log into
//! machine/session/run read models.
//!
//! A [`TelemetryNode`] wraps one [`EventStore`] and one [`Projector`]; the
//! projector is bound to the store by subscription, so every accepted append
//! keeps the read models current without the caller doing anything.

#![forbid(unsafe_code)]

pub mod projector;
pub mod store;
pub mod validate;

pub use projector::{Projector, ReadModels, fold_event};
pub use store::{AppendOutcome, EventStore, SubscriptionId};
pub use validate::{ValidationError, validate_event};

use patze_proto::TelemetryEvent;
use std::sync::Arc;

/// Per-event result of [`TelemetryNode::ingest`].
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Ok { event: TelemetryEvent },
    Error { code: String, message: String },
}

impl IngestOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One telemetry node: validating ingestor over an event store, with the
/// projector kept current via the store's subscription bus.
pub struct TelemetryNode {
    store: Arc<EventStore>,
    projector: Arc<Projector>,
}

impl TelemetryNode {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(EventStore::new());
        let projector = Arc::new(Projector::new());

        let bound = projector.clone();
        store.subscribe(move |event| bound.apply(event));

        Arc::new(Self { store, projector })
    }

    /// Validate and append one raw event. Validation errors are reported to
    /// the caller and never retried; duplicates are reported without
    /// touching the log.
    pub fn ingest(&self, raw: &serde_json::Value) -> IngestOutcome {
        let event = match validate_event(raw) {
            Ok(event) => event,
            Err(e) => {
                return IngestOutcome::Error {
                    code: e.code.to_string(),
                    message: e.message,
                };
            }
        };

        match self.store.append(event.clone()) {
            AppendOutcome::Accepted => IngestOutcome::Ok { event },
            AppendOutcome::Duplicate => IngestOutcome::Error {
                code: "duplicate_id".to_string(),
                message: format!("event '{}' already ingested", event.id),
            },
        }
    }

    /// Ingest a batch, returning one outcome per input index.
    pub fn ingest_many(&self, raws: &[serde_json::Value]) -> Vec<IngestOutcome> {
        raws.iter().map(|raw| self.ingest(raw)).collect()
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Snapshot of the current read models.
    pub fn read_models(&self) -> ReadModels {
        self.projector.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patze_proto::RunState;

    fn raw(id: &str, kind: &str, payload: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "version": "telemetry.v1",
            "id": id,
            "ts": "2026-01-15T10:00:00Z",
            "machineId": "m-1",
            "severity": "info",
            "type": kind,
            "payload": payload,
        })
    }

    #[test]
    fn test_ingest_updates_projection() {
        let node = TelemetryNode::new();
        let outcome = node.ingest(&raw("e-1", "run.started", serde_json::json!({"runId": "r-1", "sessionId": "s-1"})));
        assert!(outcome.is_ok());

        let models = node.read_models();
        assert_eq!(models.runs.get("r-1").expect("run").state, RunState::Running);
        assert_eq!(models.machines.len(), 1);
    }

    #[test]
    fn test_ingest_invalid_reports_error() {
        let node = TelemetryNode::new();
        let outcome = node.ingest(&serde_json::json!({"version": "telemetry.v1"}));
        match outcome {
            IngestOutcome::Error { code, .. } => assert_eq!(code, "missing_field"),
            IngestOutcome::Ok { .. } => panic!("expected error"),
        }
        assert!(node.store().is_empty());
    }

    #[test]
    fn test_ingest_duplicate_reported() {
        let node = TelemetryNode::new();
        let event = raw("e-1", "machine.heartbeat", serde_json::json!({}));
        assert!(node.ingest(&event).is_ok());
        match node.ingest(&event) {
            IngestOutcome::Error { code, .. } => assert_eq!(code, "duplicate_id"),
            IngestOutcome::Ok { .. } => panic!("expected duplicate"),
        }
        assert_eq!(node.store().len(), 1);
    }

    #[test]
    fn test_ingest_many_per_index_results() {
        let node = TelemetryNode::new();
        let outcomes = node.ingest_many(&[
            raw("e-1", "machine.heartbeat", serde_json::json!({})),
            serde_json::json!(42),
            raw("e-2", "session.started", serde_json::json!({"sessionId": "s-1"})),
        ]);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(!outcomes[1].is_ok());
        assert!(outcomes[2].is_ok());
    }
}
