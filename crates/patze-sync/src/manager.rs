//! Per-target sync pollers.
//!
//! One tokio task per enabled target reads the cron spool on the target's
//! interval and materializes jobs + run history into memory. A parse error
//! keeps the previous jobs list and bumps the failure counter; a clean tick
//! resets it. Status changes fan out over a broadcast channel.

use crate::spool;
use crate::targets::TargetStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_proto::{
    BridgeCheckIn, CronRunRecord, OpenClawCronJob, OpenClawSyncStatus, OpenClawTarget,
    ScheduledTask, TaskSchedule,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded per-job run history kept in memory.
pub const RUN_HISTORY_CAP: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusUpdate {
    pub target_id: String,
    pub status: OpenClawSyncStatus,
}

#[derive(Debug, Default)]
struct TargetSyncState {
    running: bool,
    available: bool,
    poll_interval_ms: u64,
    jobs: Vec<OpenClawCronJob>,
    offsets: HashMap<String, u64>,
    history: HashMap<String, VecDeque<CronRunRecord>>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_successful_sync_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

struct PollerHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// One row of the merged UI view over a target's schedule.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedScheduleEntry {
    pub source: &'static str,
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

pub struct SyncManager {
    targets: Arc<TargetStore>,
    state: Arc<Mutex<HashMap<String, TargetSyncState>>>,
    handles: Mutex<HashMap<String, PollerHandle>>,
    check_ins: Mutex<HashMap<String, BridgeCheckIn>>,
    status_tx: broadcast::Sender<SyncStatusUpdate>,
}

impl SyncManager {
    pub fn new(targets: Arc<TargetStore>) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            targets,
            state: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            check_ins: Mutex::new(HashMap::new()),
            status_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusUpdate> {
        self.status_tx.subscribe()
    }

    /// Start pollers for every enabled target.
    pub fn start_all(self: &Arc<Self>) {
        for target in self.targets.list() {
            if target.enabled {
                self.start_target(&target.id);
            }
        }
    }

    /// Start a target's poller. Idempotent: an already-running target is
    /// left alone.
    pub fn start_target(self: &Arc<Self>, target_id: &str) {
        let Some(target) = self.targets.get(target_id) else {
            warn!(target_id, "cannot start sync for unknown target");
            return;
        };

        let mut handles = self.handles.lock();
        if handles.contains_key(target_id) {
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            let entry = state.entry(target_id.to_string()).or_default();
            entry.running = true;
            entry.poll_interval_ms = target.poll_interval_ms;
        }

        let manager = self.clone();
        let join = tokio::spawn(poll_loop(manager, target, cancel_rx));
        handles.insert(
            target_id.to_string(),
            PollerHandle {
                cancel: cancel_tx,
                join,
            },
        );
        info!(target_id, "sync poller started");
    }

    /// Stop a target's poller, draining the tick in flight. Idempotent.
    pub async fn stop_target(&self, target_id: &str) {
        let handle = self.handles.lock().remove(target_id);
        let Some(handle) = handle else { return };
        let _ = handle.cancel.send(true);
        let _ = handle.join.await;
        if let Some(entry) = self.state.lock().get_mut(target_id) {
            entry.running = false;
        }
        info!(target_id, "sync poller stopped");
    }

    pub async fn restart_target(self: &Arc<Self>, target_id: &str) {
        self.stop_target(target_id).await;
        self.start_target(target_id);
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.handles.lock().keys().cloned().collect();
        for id in ids {
            self.stop_target(&id).await;
        }
    }

    pub fn get_status(&self, target_id: &str) -> Option<OpenClawSyncStatus> {
        let state = self.state.lock();
        state.get(target_id).map(|s| build_status(s, Utc::now()))
    }

    pub fn get_all_statuses(&self) -> HashMap<String, OpenClawSyncStatus> {
        let state = self.state.lock();
        let now = Utc::now();
        state
            .iter()
            .map(|(id, s)| (id.clone(), build_status(s, now)))
            .collect()
    }

    /// Statuses deduplicated across targets that point at the same
    /// directory: prefer the target whose `openclawDir` contains an online
    /// bridge machine id, then the most recently updated target.
    pub fn get_deduped_statuses(
        &self,
        online_machine_ids: &[String],
    ) -> HashMap<String, OpenClawSyncStatus> {
        let mut by_dir: HashMap<String, OpenClawTarget> = HashMap::new();
        for target in self.targets.list() {
            let preferred = match by_dir.get(&target.openclaw_dir) {
                None => true,
                Some(current) => {
                    let current_online = online_machine_ids
                        .iter()
                        .any(|m| current.openclaw_dir.contains(m.as_str()));
                    let candidate_online = online_machine_ids
                        .iter()
                        .any(|m| target.openclaw_dir.contains(m.as_str()));
                    match (candidate_online, current_online) {
                        (true, false) => true,
                        (false, true) => false,
                        // Matching rule is ambiguous when neither (or both)
                        // dirs name an online machine; newest registration
                        // wins.
                        _ => target.updated_at > current.updated_at,
                    }
                }
            };
            if preferred {
                by_dir.insert(target.openclaw_dir.clone(), target);
            }
        }

        let state = self.state.lock();
        let now = Utc::now();
        by_dir
            .into_values()
            .filter_map(|target| {
                state
                    .get(&target.id)
                    .map(|s| (target.id.clone(), build_status(s, now)))
            })
            .collect()
    }

    pub fn get_jobs(&self, target_id: &str) -> Vec<OpenClawCronJob> {
        self.state
            .lock()
            .get(target_id)
            .map(|s| s.jobs.clone())
            .unwrap_or_default()
    }

    pub fn get_run_history(
        &self,
        target_id: &str,
        job_id: &str,
        limit: Option<usize>,
    ) -> Vec<CronRunRecord> {
        let state = self.state.lock();
        let Some(entry) = state.get(target_id) else {
            return Vec::new();
        };
        let Some(history) = entry.history.get(job_id) else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(RUN_HISTORY_CAP).min(RUN_HISTORY_CAP);
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Overlay user-defined tasks with the target's OpenClaw jobs for the
    /// schedule view.
    pub fn create_merged_view(
        &self,
        target_id: &str,
        user_tasks: &[ScheduledTask],
    ) -> Vec<MergedScheduleEntry> {
        let mut out: Vec<MergedScheduleEntry> = self
            .get_jobs(target_id)
            .into_iter()
            .map(|job| MergedScheduleEntry {
                source: "openclaw",
                id: job.id,
                name: job.name,
                schedule: job.schedule,
                enabled: job.enabled,
                last_run_at: job.last_run_at,
            })
            .collect();

        out.extend(user_tasks.iter().map(|task| MergedScheduleEntry {
            source: "task",
            id: task.id.clone(),
            name: task.name.clone(),
            schedule: Some(render_schedule(&task.schedule)),
            enabled: task.enabled,
            last_run_at: task.last_run_at,
        }));

        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Record a bridge check-in against its target.
    pub fn record_check_in(&self, target_id: &str, check_in: BridgeCheckIn) {
        self.check_ins.lock().insert(target_id.to_string(), check_in);
    }

    pub fn get_check_in(&self, target_id: &str) -> Option<BridgeCheckIn> {
        self.check_ins.lock().get(target_id).cloned()
    }

    /// Machine ids with a check-in younger than the heartbeat timeout.
    pub fn online_machine_ids(&self, heartbeat_timeout_ms: u64) -> Vec<String> {
        let now = Utc::now();
        let check_ins = self.check_ins.lock();
        let mut ids: Vec<String> = check_ins
            .values()
            .filter(|c| {
                now.signed_duration_since(c.heartbeat_at).num_milliseconds()
                    <= heartbeat_timeout_ms as i64
            })
            .map(|c| c.machine_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// One synchronous tick against the spool; exposed for tests and for
    /// forced refreshes from the API.
    pub fn tick(&self, target_id: &str, openclaw_dir: &Path) {
        let now = Utc::now();
        let jobs_result = spool::read_jobs(openclaw_dir);

        let mut state = self.state.lock();
        let entry = state.entry(target_id.to_string()).or_default();
        entry.last_attempt_at = Some(now);
        entry.available = openclaw_dir.exists();

        match jobs_result {
            Err(message) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(message);
                // Previous jobs list is intentionally kept.
            }
            Ok(jobs) => {
                entry.jobs = jobs;
                let mut tick_error: Option<String> = None;
                let job_ids: Vec<String> = entry.jobs.iter().map(|j| j.id.clone()).collect();
                for job_id in job_ids {
                    let offset = entry.offsets.get(&job_id).copied().unwrap_or(0);
                    match spool::read_run_delta(openclaw_dir, &job_id, offset) {
                        Ok((records, new_offset)) => {
                            entry.offsets.insert(job_id.clone(), new_offset);
                            let ring = entry.history.entry(job_id).or_default();
                            for record in records {
                                if ring.len() == RUN_HISTORY_CAP {
                                    ring.pop_front();
                                }
                                ring.push_back(record);
                            }
                        }
                        Err(e) => {
                            tick_error = Some(format!("run history unreadable: {}", e.kind()));
                        }
                    }
                }

                match tick_error {
                    Some(message) => {
                        entry.consecutive_failures += 1;
                        entry.last_error = Some(message);
                    }
                    None => {
                        entry.consecutive_failures = 0;
                        entry.last_error = None;
                        entry.last_successful_sync_at = Some(now);
                    }
                }
            }
        }

        let update = SyncStatusUpdate {
            target_id: target_id.to_string(),
            status: build_status(entry, now),
        };
        drop(state);
        let _ = self.status_tx.send(update);
    }
}

fn build_status(state: &TargetSyncState, now: DateTime<Utc>) -> OpenClawSyncStatus {
    OpenClawSyncStatus {
        running: state.running,
        available: state.available,
        poll_interval_ms: state.poll_interval_ms,
        jobs_count: state.jobs.len(),
        last_attempt_at: state.last_attempt_at,
        last_successful_sync_at: state.last_successful_sync_at,
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error.clone(),
        stale: OpenClawSyncStatus::compute_stale(
            state.last_successful_sync_at,
            state.poll_interval_ms.max(1),
            now,
        ),
    }
}

fn render_schedule(schedule: &TaskSchedule) -> String {
    match schedule {
        TaskSchedule::At { at } => format!("at {}", at.to_rfc3339()),
        TaskSchedule::Every { every_ms } => format!("every {every_ms}ms"),
        TaskSchedule::Cron { expr } => expr.clone(),
    }
}

async fn poll_loop(
    manager: Arc<SyncManager>,
    target: OpenClawTarget,
    mut cancel: watch::Receiver<bool>,
) {
    let dir = PathBuf::from(&target.openclaw_dir);
    let period = std::time::Duration::from_millis(target.poll_interval_ms.max(1_000));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                manager.tick(&target.id, &dir);
            }
        }
    }
    debug!(target_id = %target.id, "poll loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::NewTarget;
    use patze_proto::{CronRunStatus, TargetOrigin, TargetPurpose, TargetType};
    use std::path::Path;

    fn fixture(tmp: &Path) -> (Arc<TargetStore>, Arc<SyncManager>, OpenClawTarget, PathBuf) {
        let home = tmp.join("home");
        let dir = home.join(".openclaw");
        std::fs::create_dir_all(&dir).expect("mkdir");

        let targets = Arc::new(TargetStore::new(&tmp.join("cron-store"), home));
        let target = targets
            .create(NewTarget {
                label: "local".to_string(),
                target_type: TargetType::Local,
                origin: TargetOrigin::User,
                purpose: TargetPurpose::Production,
                openclaw_dir: dir.to_string_lossy().into_owned(),
                poll_interval_ms: Some(1_000),
            })
            .expect("create");
        let manager = SyncManager::new(targets.clone());
        (targets, manager, target, dir)
    }

    fn write_jobs_file(dir: &Path, ids: &[&str]) {
        let jobs: Vec<OpenClawCronJob> = ids
            .iter()
            .map(|id| OpenClawCronJob {
                id: id.to_string(),
                name: format!("job {id}"),
                schedule: Some("0 * * * *".to_string()),
                enabled: true,
                last_run_at: None,
                next_run_at: None,
            })
            .collect();
        spool::write_jobs(dir, &jobs).expect("write jobs");
    }

    fn append_run(dir: &Path, job_id: &str, run_id: &str) {
        patze_persist::append_jsonl(
            &spool::runs_path(dir, job_id),
            &CronRunRecord {
                job_id: job_id.to_string(),
                run_id: run_id.to_string(),
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                status: CronRunStatus::Ok,
                error: None,
                duration_ms: Some(10),
                session_id: None,
            },
        )
        .expect("append run");
    }

    #[tokio::test]
    async fn test_tick_reads_jobs_and_runs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, dir) = fixture(tmp.path());

        write_jobs_file(&dir, &["j1"]);
        append_run(&dir, "j1", "r1");
        manager.tick(&target.id, &dir);

        let status = manager.get_status(&target.id).expect("status");
        assert_eq!(status.jobs_count, 1);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_successful_sync_at.is_some());

        assert_eq!(manager.get_jobs(&target.id).len(), 1);
        assert_eq!(manager.get_run_history(&target.id, "j1", None).len(), 1);

        // Second tick only picks up the delta.
        append_run(&dir, "j1", "r2");
        manager.tick(&target.id, &dir);
        let history = manager.get_run_history(&target.id, "j1", None);
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].run_id, "r2");
    }

    #[tokio::test]
    async fn test_parse_error_keeps_previous_jobs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, dir) = fixture(tmp.path());

        write_jobs_file(&dir, &["j1", "j2"]);
        manager.tick(&target.id, &dir);
        assert_eq!(manager.get_jobs(&target.id).len(), 2);

        std::fs::write(spool::jobs_path(&dir), "{oops").expect("corrupt");
        manager.tick(&target.id, &dir);

        let status = manager.get_status(&target.id).expect("status");
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        // Previous jobs list survived the bad parse.
        assert_eq!(manager.get_jobs(&target.id).len(), 2);

        // Recovery resets the counter.
        write_jobs_file(&dir, &["j1"]);
        manager.tick(&target.id, &dir);
        assert_eq!(manager.get_status(&target.id).expect("status").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_start_stop_poller() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, dir) = fixture(tmp.path());
        write_jobs_file(&dir, &["j1"]);

        manager.start_target(&target.id);
        // Idempotent second start.
        manager.start_target(&target.id);
        assert!(manager.get_status(&target.id).expect("status").running);

        manager.stop_target(&target.id).await;
        assert!(!manager.get_status(&target.id).expect("status").running);
        // Idempotent second stop.
        manager.stop_target(&target.id).await;
    }

    #[tokio::test]
    async fn test_status_broadcast() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, dir) = fixture(tmp.path());
        write_jobs_file(&dir, &["j1"]);

        let mut rx = manager.subscribe();
        manager.tick(&target.id, &dir);
        let update = rx.recv().await.expect("update");
        assert_eq!(update.target_id, target.id);
        assert_eq!(update.status.jobs_count, 1);
    }

    #[tokio::test]
    async fn test_merged_view_overlays_tasks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, dir) = fixture(tmp.path());
        write_jobs_file(&dir, &["backup"]);
        manager.tick(&target.id, &dir);

        let task = ScheduledTask {
            id: "task-1".to_string(),
            name: "fleet report".to_string(),
            schedule: TaskSchedule::Every { every_ms: 60_000 },
            action: patze_proto::TaskAction::GenerateReport,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
        };
        let view = manager.create_merged_view(&target.id, &[task]);
        assert_eq!(view.len(), 2);
        assert!(view.iter().any(|e| e.source == "openclaw"));
        assert!(view.iter().any(|e| e.source == "task"));
    }

    #[tokio::test]
    async fn test_check_in_online_window() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_targets, manager, target, _dir) = fixture(tmp.path());

        manager.record_check_in(
            &target.id,
            BridgeCheckIn {
                machine_id: "m-1".to_string(),
                machine_label: None,
                bridge_version: Some("1.0.0".to_string()),
                config_hash: "h".to_string(),
                heartbeat_at: Utc::now(),
            },
        );
        assert_eq!(manager.online_machine_ids(60_000), vec!["m-1".to_string()]);

        manager.record_check_in(
            &target.id,
            BridgeCheckIn {
                machine_id: "m-1".to_string(),
                machine_label: None,
                bridge_version: None,
                config_hash: "h".to_string(),
                heartbeat_at: Utc::now() - chrono::Duration::minutes(10),
            },
        );
        assert!(manager.online_machine_ids(60_000).is_empty());
    }
}
