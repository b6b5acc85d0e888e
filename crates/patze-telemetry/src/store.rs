//! Append-only event log with synchronous in-order fan-out.

use parking_lot::Mutex;
use patze_proto::TelemetryEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Outcome of appending a validated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    Duplicate,
}

/// Handle returned by [`EventStore::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

struct StoreInner {
    log: Vec<TelemetryEvent>,
    seen_ids: HashSet<String>,
    listeners: HashMap<u64, Listener>,
    next_subscription: u64,
}

/// Append-only log of validated telemetry events.
///
/// Guarantees: insertion order is preserved, duplicate ids are rejected
/// without emission, and listeners observe appends synchronously in append
/// order. Listeners must not call back into the store.
pub struct EventStore {
    inner: Mutex<StoreInner>,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                log: Vec::new(),
                seen_ids: HashSet::new(),
                listeners: HashMap::new(),
                next_subscription: 0,
            }),
        }
    }

    /// Append an already-validated event. Duplicate ids are rejected and
    /// nothing is emitted. Listeners fire while the append lock is held so
    /// that concurrent appends cannot reorder notifications; a panicking
    /// listener is isolated and the rest still fire.
    pub fn append(&self, event: TelemetryEvent) -> AppendOutcome {
        let mut inner = self.inner.lock();
        if !inner.seen_ids.insert(event.id.clone()) {
            return AppendOutcome::Duplicate;
        }
        inner.log.push(event.clone());

        let listeners: Vec<Listener> = inner.listeners.values().cloned().collect();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!(event_id = %event.id, "event listener panicked; continuing fan-out");
            }
        }
        AppendOutcome::Accepted
    }

    /// Snapshot copy of the full log, in insertion order.
    pub fn log(&self) -> Vec<TelemetryEvent> {
        self.inner.lock().log.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, listener: impl Fn(&TelemetryEvent) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.listeners.insert(id, Arc::new(listener));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().listeners.remove(&id.0);
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}
