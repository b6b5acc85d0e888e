//! Telemetry aggregator: attaches N telemetry nodes and maintains one
//! totally-ordered unified snapshot across all of them.
//!
//! The merged log is ordered by `(ts, id, nodeId, localIndex)` and the
//! unified read model is the deterministic fold of that order, so the
//! result never depends on which node was attached first. Correctness over
//! incrementality: every append triggers a full recompute under the
//! aggregator lock, and the indexes are rebuilt whole.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_proto::TelemetryEvent;
use patze_telemetry::{ReadModels, SubscriptionId, TelemetryNode, fold_event};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::debug;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("node '{0}' is already attached")]
    AlreadyAttached(String),
}

// ─── Merged log & snapshot ────────────────────────────────────────────────────

/// One event in the merged log, tagged with its origin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedEvent {
    pub node_id: String,
    pub local_index: u64,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// The frozen result of one recomputation. Handed out by `Arc`; never
/// mutated after construction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedSnapshot {
    pub log: Vec<MergedEvent>,
    pub models: ReadModels,
    pub sessions_by_machine: HashMap<String, Vec<String>>,
    pub runs_by_session: HashMap<String, Vec<String>>,
    pub active_runs_by_machine: HashMap<String, Vec<String>>,
    pub node_ids: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl UnifiedSnapshot {
    fn empty() -> Self {
        Self {
            log: Vec::new(),
            models: ReadModels::default(),
            sessions_by_machine: HashMap::new(),
            runs_by_session: HashMap::new(),
            active_runs_by_machine: HashMap::new(),
            node_ids: Vec::new(),
            computed_at: Utc::now(),
        }
    }
}

/// Total order over the merged log: `(ts, id, nodeId, localIndex)`.
fn merge_key(entry: &MergedEvent) -> (DateTime<Utc>, &str, &str, u64) {
    (
        entry.event.ts,
        entry.event.id.as_str(),
        entry.node_id.as_str(),
        entry.local_index,
    )
}

// ─── Aggregator ───────────────────────────────────────────────────────────────

type SnapshotListener = Arc<dyn Fn(&Arc<UnifiedSnapshot>) + Send + Sync>;
type EventListener = Arc<dyn Fn(&str, &TelemetryEvent) + Send + Sync>;

/// Handle for aggregator subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggSubscriptionId(u64);

struct NodeAttachment {
    node: Arc<TelemetryNode>,
    store_subscription: SubscriptionId,
    next_local_index: u64,
}

struct AggInner {
    nodes: HashMap<String, NodeAttachment>,
    entries: Vec<MergedEvent>,
    seen: HashSet<(String, String)>,
    snapshot: Arc<UnifiedSnapshot>,
    snapshot_subs: HashMap<u64, SnapshotListener>,
    event_subs: HashMap<u64, EventListener>,
    next_sub: u64,
}

/// Merges the event streams of attached [`TelemetryNode`]s. Nodes outlive
/// their attachment; the aggregator only borrows them via `Arc`.
pub struct Aggregator {
    inner: Mutex<AggInner>,
    self_ref: Mutex<Weak<Aggregator>>,
}

impl Aggregator {
    pub fn new() -> Arc<Self> {
        let agg = Arc::new(Self {
            inner: Mutex::new(AggInner {
                nodes: HashMap::new(),
                entries: Vec::new(),
                seen: HashSet::new(),
                snapshot: Arc::new(UnifiedSnapshot::empty()),
                snapshot_subs: HashMap::new(),
                event_subs: HashMap::new(),
                next_sub: 0,
            }),
            self_ref: Mutex::new(Weak::new()),
        });
        *agg.self_ref.lock() = Arc::downgrade(&agg);
        agg
    }

    /// Attach a node: subscribe to its stream, seed from its existing log
    /// (deduplicated by `(nodeId, eventId)`), and recompute.
    pub fn attach_node(&self, node_id: &str, node: Arc<TelemetryNode>) -> Result<(), AttachError> {
        {
            let inner = self.inner.lock();
            if inner.nodes.contains_key(node_id) {
                return Err(AttachError::AlreadyAttached(node_id.to_string()));
            }
        }

        // Subscribe before seeding so no append can fall between the two;
        // the dedupe set collapses any overlap.
        let weak = self.self_ref.lock().clone();
        let listener_node_id = node_id.to_string();
        let subscription = node.store().subscribe(move |event| {
            if let Some(agg) = weak.upgrade() {
                agg.absorb(&listener_node_id, event);
            }
        });

        {
            let mut inner = self.inner.lock();
            inner.nodes.insert(
                node_id.to_string(),
                NodeAttachment {
                    node: node.clone(),
                    store_subscription: subscription,
                    next_local_index: 0,
                },
            );
        }

        let seeded = node.store().log();
        debug!(node_id, count = seeded.len(), "seeding aggregator from node log");
        for event in &seeded {
            self.absorb(node_id, event);
        }
        // An empty node still changes the node list in the snapshot.
        self.recompute_and_publish(None);
        Ok(())
    }

    /// Detach a node and drop its events from the merged log. Idempotent.
    pub fn detach_node(&self, node_id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.nodes.remove(node_id)
        };
        let Some(attachment) = removed else { return };
        attachment.node.store().unsubscribe(attachment.store_subscription);

        {
            let mut inner = self.inner.lock();
            inner.entries.retain(|e| e.node_id != node_id);
            inner.seen.retain(|(nid, _)| nid != node_id);
        }
        self.recompute_and_publish(None);
    }

    pub fn attached_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current unified snapshot (frozen).
    pub fn snapshot(&self) -> Arc<UnifiedSnapshot> {
        self.inner.lock().snapshot.clone()
    }

    pub fn subscribe_snapshots(
        &self,
        listener: impl Fn(&Arc<UnifiedSnapshot>) + Send + Sync + 'static,
    ) -> AggSubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.snapshot_subs.insert(id, Arc::new(listener));
        AggSubscriptionId(id)
    }

    pub fn subscribe_events(
        &self,
        listener: impl Fn(&str, &TelemetryEvent) + Send + Sync + 'static,
    ) -> AggSubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.event_subs.insert(id, Arc::new(listener));
        AggSubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: AggSubscriptionId) {
        let mut inner = self.inner.lock();
        inner.snapshot_subs.remove(&id.0);
        inner.event_subs.remove(&id.0);
    }

    /// Take one event from a node (live or seeded) into the merged log.
    fn absorb(&self, node_id: &str, event: &TelemetryEvent) {
        {
            let mut inner = self.inner.lock();
            let key = (node_id.to_string(), event.id.clone());
            if !inner.seen.insert(key) {
                return;
            }
            let Some(attachment) = inner.nodes.get_mut(node_id) else {
                return;
            };
            let local_index = attachment.next_local_index;
            attachment.next_local_index += 1;
            inner.entries.push(MergedEvent {
                node_id: node_id.to_string(),
                local_index,
                event: event.clone(),
            });
        }
        self.recompute_and_publish(Some((node_id, event)));
    }

    /// Rebuild the unified snapshot from scratch and fan out. Intermediate
    /// states are never observable: the snapshot swap happens under the
    /// aggregator lock.
    fn recompute_and_publish(&self, emitted: Option<(&str, &TelemetryEvent)>) {
        let (snapshot, snapshot_subs, event_subs) = {
            let mut inner = self.inner.lock();

            let mut log = inner.entries.clone();
            log.sort_by(|a, b| merge_key(a).cmp(&merge_key(b)));

            let mut models = ReadModels::default();
            for entry in &log {
                fold_event(&mut models, &entry.event);
            }

            let mut sessions_by_machine: HashMap<String, Vec<String>> = HashMap::new();
            for session in models.sessions.values() {
                sessions_by_machine
                    .entry(session.machine_id.clone())
                    .or_default()
                    .push(session.session_id.clone());
            }
            let mut runs_by_session: HashMap<String, Vec<String>> = HashMap::new();
            let mut active_runs_by_machine: HashMap<String, Vec<String>> = HashMap::new();
            for run in models.runs.values() {
                runs_by_session
                    .entry(run.session_id.clone())
                    .or_default()
                    .push(run.run_id.clone());
                if run.state.is_active() {
                    active_runs_by_machine
                        .entry(run.machine_id.clone())
                        .or_default()
                        .push(run.run_id.clone());
                }
            }
            for ids in sessions_by_machine
                .values_mut()
                .chain(runs_by_session.values_mut())
                .chain(active_runs_by_machine.values_mut())
            {
                ids.sort();
            }

            let mut node_ids: Vec<String> = inner.nodes.keys().cloned().collect();
            node_ids.sort();

            let snapshot = Arc::new(UnifiedSnapshot {
                log,
                models,
                sessions_by_machine,
                runs_by_session,
                active_runs_by_machine,
                node_ids,
                computed_at: Utc::now(),
            });
            inner.snapshot = snapshot.clone();

            let snapshot_subs: Vec<SnapshotListener> = inner.snapshot_subs.values().cloned().collect();
            let event_subs: Vec<EventListener> = inner.event_subs.values().cloned().collect();
            (snapshot, snapshot_subs, event_subs)
        };

        for listener in snapshot_subs {
            listener(&snapshot);
        }
        if let Some((node_id, event)) = emitted {
            for listener in event_subs {
                listener(node_id, event);
            }
        }
    }
}
