//! The cron service: persisted task set, a single scheduler loop, and
//! bounded run history per task.
//!
//! Task-set edits snapshot the previous set first, so a bad bulk edit can
//! be rolled back the same way config applies can.

use crate::executor::{TaskExecution, TaskExecutor};
use crate::schedule::{ScheduleError, is_due, validate_schedule};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_persist::JsonStore;
use patze_proto::{ScheduledTask, TaskAction, TaskRunRecord, TaskSchedule};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const TASK_HISTORY_CAP: usize = 100;
const SCHEDULER_TICK: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CronError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("task snapshot '{0}' not found")]
    SnapshotNotFound(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    pub schedule: TaskSchedule,
    pub action: TaskAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A snapshot of the whole task set, taken before each mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSetSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub tasks: Vec<ScheduledTask>,
}

struct Inner {
    tasks: HashMap<String, ScheduledTask>,
    history: HashMap<String, VecDeque<TaskRunRecord>>,
    snapshots: HashMap<String, TaskSetSnapshot>,
}

pub struct CronService {
    inner: Mutex<Inner>,
    tasks_store: JsonStore,
    snapshots_store: JsonStore,
    executor: Arc<dyn TaskExecutor>,
    scheduler: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl CronService {
    pub fn new(state_path: &Path, executor: Arc<dyn TaskExecutor>) -> Arc<Self> {
        let tasks_store = JsonStore::new(state_path, "cron_tasks");
        let snapshots_store = JsonStore::new(state_path, "cron_task_snapshots");
        let tasks: HashMap<String, ScheduledTask> = tasks_store.load();
        let snapshots: HashMap<String, TaskSetSnapshot> = snapshots_store.load();
        info!(count = tasks.len(), "loaded scheduled tasks");

        Arc::new(Self {
            inner: Mutex::new(Inner {
                tasks,
                history: HashMap::new(),
                snapshots,
            }),
            tasks_store,
            snapshots_store,
            executor,
            scheduler: Mutex::new(None),
        })
    }

    // ─── Task CRUD ───────────────────────────────────────────────────────────

    pub fn create_task(&self, new: NewTask) -> Result<ScheduledTask, CronError> {
        validate_schedule(&new.schedule)?;
        let now = Utc::now();
        let task = ScheduledTask {
            id: patze_proto::prefixed_id("task"),
            name: new.name,
            schedule: new.schedule,
            action: new.action,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        };

        let mut inner = self.inner.lock();
        self.snapshot_tasks(&mut inner, "before create");
        inner.tasks.insert(task.id.clone(), task.clone());
        self.persist(&inner);
        info!(task_id = %task.id, name = %task.name, "task created");
        Ok(task)
    }

    pub fn update_task(&self, id: &str, new: NewTask) -> Result<ScheduledTask, CronError> {
        validate_schedule(&new.schedule)?;
        let mut inner = self.inner.lock();
        if !inner.tasks.contains_key(id) {
            return Err(CronError::TaskNotFound(id.to_string()));
        }
        self.snapshot_tasks(&mut inner, "before update");

        let task = inner.tasks.get_mut(id).ok_or_else(|| CronError::TaskNotFound(id.to_string()))?;
        task.name = new.name;
        task.schedule = new.schedule;
        task.action = new.action;
        task.enabled = new.enabled;
        task.updated_at = Utc::now();
        let updated = task.clone();
        self.persist(&inner);
        Ok(updated)
    }

    pub fn delete_task(&self, id: &str) -> Result<(), CronError> {
        let mut inner = self.inner.lock();
        if !inner.tasks.contains_key(id) {
            return Err(CronError::TaskNotFound(id.to_string()));
        }
        self.snapshot_tasks(&mut inner, "before delete");
        inner.tasks.remove(id);
        inner.history.remove(id);
        self.persist(&inner);
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Option<ScheduledTask> {
        self.inner.lock().tasks.get(id).cloned()
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let inner = self.inner.lock();
        let mut out: Vec<ScheduledTask> = inner.tasks.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn run_history(&self, task_id: &str, limit: Option<usize>) -> Vec<TaskRunRecord> {
        let inner = self.inner.lock();
        let Some(history) = inner.history.get(task_id) else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(TASK_HISTORY_CAP).min(TASK_HISTORY_CAP);
        history.iter().rev().take(limit).cloned().collect()
    }

    // ─── Task-set snapshots ──────────────────────────────────────────────────

    pub fn list_task_snapshots(&self) -> Vec<TaskSetSnapshot> {
        let inner = self.inner.lock();
        let mut out: Vec<TaskSetSnapshot> = inner.snapshots.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Restore the task set to a snapshot. The current set is snapshotted
    /// first so the restore is itself reversible.
    pub fn rollback_tasks(&self, snapshot_id: &str) -> Result<usize, CronError> {
        let mut inner = self.inner.lock();
        let snapshot = inner
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| CronError::SnapshotNotFound(snapshot_id.to_string()))?;

        self.snapshot_tasks(&mut inner, "before rollback");
        inner.tasks = snapshot
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        self.persist(&inner);
        info!(snapshot_id, restored = snapshot.tasks.len(), "task set rolled back");
        Ok(snapshot.tasks.len())
    }

    fn snapshot_tasks(&self, inner: &mut Inner, reason: &str) {
        let snapshot = TaskSetSnapshot {
            id: patze_proto::prefixed_id("tsnap"),
            created_at: Utc::now(),
            reason: reason.to_string(),
            tasks: inner.tasks.values().cloned().collect(),
        };
        inner.snapshots.insert(snapshot.id.clone(), snapshot);
        if let Err(e) = self.snapshots_store.save(&inner.snapshots) {
            warn!(error = %e, "failed to persist task snapshots");
        }
    }

    // ─── Execution ───────────────────────────────────────────────────────────

    /// Execute one task now, recording history and `last_run_at`.
    pub async fn run_task(&self, id: &str) -> Result<TaskExecution, CronError> {
        let task = self
            .get_task(id)
            .ok_or_else(|| CronError::TaskNotFound(id.to_string()))?;

        let started_at = Utc::now();
        let execution = self.executor.execute(&task).await;
        let ended_at = Utc::now();

        let record = TaskRunRecord {
            task_id: task.id.clone(),
            run_id: patze_proto::prefixed_id("trun"),
            started_at,
            ended_at,
            ok: execution.ok,
            summary: execution.summary.clone(),
        };

        let mut inner = self.inner.lock();
        if let Some(stored) = inner.tasks.get_mut(id) {
            stored.last_run_at = Some(started_at);
        }
        let ring = inner.history.entry(task.id.clone()).or_default();
        if ring.len() == TASK_HISTORY_CAP {
            ring.pop_front();
        }
        ring.push_back(record);
        self.persist(&inner);

        debug!(task_id = %id, ok = execution.ok, summary = %execution.summary, "task executed");
        Ok(execution)
    }

    /// Tasks due at `now`. Exposed for the loop and for tests.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let inner = self.inner.lock();
        let mut due: Vec<ScheduledTask> = inner
            .tasks
            .values()
            .filter(|t| t.enabled && is_due(&t.schedule, t.last_run_at, now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        due
    }

    /// Start the scheduler loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return;
        }
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let service = self.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCHEDULER_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let due = service.due_tasks(Utc::now());
                        for task in due {
                            if let Err(e) = service.run_task(&task.id).await {
                                warn!(task_id = %task.id, error = %e, "scheduled run failed");
                            }
                        }
                    }
                }
            }
            debug!("cron scheduler stopped");
        });
        *scheduler = Some((cancel_tx, join));
        info!("cron scheduler started");
    }

    /// Stop the scheduler, draining any in-flight task.
    pub async fn stop(&self) {
        let taken = self.scheduler.lock().take();
        if let Some((cancel, join)) = taken {
            let _ = cancel.send(true);
            let _ = join.await;
        }
    }

    fn persist(&self, inner: &Inner) {
        if let Err(e) = self.tasks_store.save(&inner.tasks) {
            warn!(error = %e, "failed to persist tasks");
        }
    }
}
