//! Config command queue: transactional apply of CLI invocations against a
//! target's OpenClaw directory.
//!
//! Pending commands are previewed in a sandbox copy of the config directory
//! and applied transactionally in the real one: the queue snapshots
//! `openclaw.json` before running anything, and any non-zero exit restores
//! the snapshot byte-for-byte. Snapshots double as a time-travel history.

#![forbid(unsafe_code)]

use chrono::Utc;
use parking_lot::Mutex;
use patze_persist::{JsonStore, write_atomic};
use patze_proto::{CliInvocation, ConfigSnapshot};
use patze_sync::TargetStore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Only binary the queue will invoke, absent an explicit override.
pub const ALLOWED_BINARY: &str = "openclaw";
/// Per-command wall clock budget.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap applied to each captured stream.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("target '{0}' not found")]
    TargetNotFound(String),
    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),
    #[error("command blocked: {0}")]
    CommandBlocked(String),
    #[error("sandbox setup failed")]
    Sandbox(#[source] std::io::Error),
    #[error("config I/O failed")]
    Io(#[from] std::io::Error),
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub simulated: bool,
    pub command_count: usize,
    pub before: String,
    pub after: String,
    pub changed: bool,
    pub outputs: Vec<CommandOutput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub ok: bool,
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outputs: Vec<CommandOutput>,
}

// ─── Queue ────────────────────────────────────────────────────────────────────

struct Inner {
    pending: HashMap<String, Vec<CliInvocation>>,
    snapshots: HashMap<String, ConfigSnapshot>,
}

pub struct ConfigCommandQueue {
    targets: Arc<TargetStore>,
    inner: Mutex<Inner>,
    store: JsonStore,
    allowed_binary: String,
}

impl ConfigCommandQueue {
    pub fn new(targets: Arc<TargetStore>, state_path: &Path) -> Self {
        Self::with_allowed_binary(targets, state_path, ALLOWED_BINARY)
    }

    /// Override the allowed binary. The override must be an absolute path
    /// with no `.`/`..` components; anything else keeps the default.
    pub fn with_allowed_binary(
        targets: Arc<TargetStore>,
        state_path: &Path,
        allowed_binary: &str,
    ) -> Self {
        let allowed = if allowed_binary == ALLOWED_BINARY || is_clean_absolute(allowed_binary) {
            allowed_binary.to_string()
        } else {
            warn!(binary = allowed_binary, "rejected binary override; using default");
            ALLOWED_BINARY.to_string()
        };

        let store = JsonStore::new(state_path, "config_snapshots");
        let snapshots = store.load();
        Self {
            targets,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                snapshots,
            }),
            store,
            allowed_binary: allowed,
        }
    }

    /// Queue one invocation for a target. The binary is checked here, at
    /// queue time, so a blocked command never sits pending.
    pub fn queue_command(
        &self,
        target_id: &str,
        invocation: CliInvocation,
    ) -> Result<usize, ApplyError> {
        self.resolve_dir(target_id)?;
        if invocation.command != self.allowed_binary {
            return Err(ApplyError::CommandBlocked(format!(
                "only '{}' may be invoked",
                self.allowed_binary
            )));
        }
        let mut inner = self.inner.lock();
        let queue = inner.pending.entry(target_id.to_string()).or_default();
        queue.push(invocation);
        Ok(queue.len())
    }

    pub fn pending(&self, target_id: &str) -> Vec<CliInvocation> {
        self.inner
            .lock()
            .pending
            .get(target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_pending(&self, target_id: &str) {
        self.inner.lock().pending.remove(target_id);
    }

    /// Run the pending commands against a sandbox copy of the config
    /// directory and report the `openclaw.json` before/after. The real
    /// directory is never touched.
    pub async fn preview(&self, target_id: &str) -> Result<PreviewResult, ApplyError> {
        let dir = self.resolve_dir(target_id)?;
        let pending = self.pending(target_id);

        let sandbox = tempfile::tempdir().map_err(ApplyError::Sandbox)?;
        let sandbox_dir = sandbox.path().join("config");
        {
            let src = dir.clone();
            let dst = sandbox_dir.clone();
            tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
                .await
                .map_err(|e| ApplyError::Sandbox(std::io::Error::other(e)))?
                .map_err(ApplyError::Sandbox)?;
        }

        let before = String::from_utf8_lossy(&patze_sync::spool::read_config(&sandbox_dir)).into_owned();
        let mut outputs = Vec::new();
        for invocation in &pending {
            let output = run_invocation(invocation, &sandbox_dir).await;
            let failed = output.exit_code != 0;
            outputs.push(output);
            if failed {
                break;
            }
        }
        let after = String::from_utf8_lossy(&patze_sync::spool::read_config(&sandbox_dir)).into_owned();

        Ok(PreviewResult {
            simulated: true,
            command_count: pending.len(),
            changed: before != after,
            before,
            after,
            outputs,
        })
    }

    /// Apply the pending commands in the real directory. Transactional: on
    /// the first non-zero exit, `openclaw.json` is restored byte-identical
    /// from the pre-apply snapshot and the queue keeps its pending list.
    pub async fn apply(&self, target_id: &str, source: &str) -> Result<ApplyResult, ApplyError> {
        let dir = self.resolve_dir(target_id)?;
        let pending = self.pending(target_id);

        let snapshot = self.take_snapshot(target_id, &dir, source, "pre-apply")?;
        let mut outputs = Vec::new();

        for invocation in &pending {
            let output = run_invocation(invocation, &dir).await;
            let failed = output.exit_code != 0;
            let description = invocation.description.clone();
            outputs.push(output);

            if failed {
                self.restore_snapshot_bytes(&snapshot, &dir)?;
                warn!(target_id, %description, "apply failed; config rolled back");
                return Ok(ApplyResult {
                    ok: false,
                    snapshot_id: snapshot.id,
                    error: Some(format!("command failed: {description}")),
                    outputs,
                });
            }
        }

        self.clear_pending(target_id);
        info!(target_id, commands = outputs.len(), "config apply committed");
        Ok(ApplyResult {
            ok: true,
            snapshot_id: snapshot.id,
            error: None,
            outputs,
        })
    }

    pub fn list_snapshots(&self, target_id: &str) -> Vec<ConfigSnapshot> {
        let inner = self.inner.lock();
        let mut out: Vec<ConfigSnapshot> = inner
            .snapshots
            .values()
            .filter(|s| s.target_id == target_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Option<ConfigSnapshot> {
        self.inner.lock().snapshots.get(snapshot_id).cloned()
    }

    /// Restore the config to a snapshot's contents. A pre-rollback snapshot
    /// is taken first so the rollback itself can be undone.
    pub fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<ConfigSnapshot, ApplyError> {
        let snapshot = self
            .get_snapshot(snapshot_id)
            .ok_or_else(|| ApplyError::SnapshotNotFound(snapshot_id.to_string()))?;
        let dir = self.resolve_dir(&snapshot.target_id)?;

        let guard = self.take_snapshot(&snapshot.target_id, &dir, "rollback", "pre-rollback")?;
        self.restore_snapshot_bytes(&snapshot, &dir)?;
        info!(
            target_id = %snapshot.target_id,
            snapshot_id,
            guard_snapshot = %guard.id,
            "config rolled back to snapshot"
        );
        Ok(snapshot)
    }

    fn resolve_dir(&self, target_id: &str) -> Result<PathBuf, ApplyError> {
        self.targets
            .get(target_id)
            .map(|t| PathBuf::from(t.openclaw_dir))
            .ok_or_else(|| ApplyError::TargetNotFound(target_id.to_string()))
    }

    fn take_snapshot(
        &self,
        target_id: &str,
        dir: &Path,
        source: &str,
        note: &str,
    ) -> Result<ConfigSnapshot, ApplyError> {
        let raw = patze_sync::spool::read_config(dir);
        let snapshot = ConfigSnapshot {
            id: patze_proto::prefixed_id("snap"),
            target_id: target_id.to_string(),
            created_at: Utc::now(),
            source: source.to_string(),
            note: note.to_string(),
            raw_config: String::from_utf8_lossy(&raw).into_owned(),
        };

        let mut inner = self.inner.lock();
        inner.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        if let Err(e) = self.store.save(&inner.snapshots) {
            warn!(error = %e, "failed to persist snapshots");
        }
        Ok(snapshot)
    }

    fn restore_snapshot_bytes(&self, snapshot: &ConfigSnapshot, dir: &Path) -> Result<(), ApplyError> {
        let path = patze_sync::spool::config_path(dir);
        write_atomic(&path, snapshot.raw_config.as_bytes())?;
        Ok(())
    }
}

// ─── Command execution ────────────────────────────────────────────────────────

async fn run_invocation(invocation: &CliInvocation, dir: &Path) -> CommandOutput {
    let spawned = Command::new(&invocation.command)
        .args(&invocation.args)
        .current_dir(dir)
        .env("OPENCLAW_HOME", dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(COMMAND_TIMEOUT, spawned).await {
        Err(_) => CommandOutput {
            command: invocation.command.clone(),
            args: invocation.args.clone(),
            exit_code: -1,
            stdout: String::new(),
            stderr: "command timed out".to_string(),
            truncated: false,
            timed_out: true,
        },
        Ok(Err(e)) => CommandOutput {
            command: invocation.command.clone(),
            args: invocation.args.clone(),
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("spawn failed: {}", e.kind()),
            truncated: false,
            timed_out: false,
        },
        Ok(Ok(output)) => {
            let (stdout, out_trunc) = cap_output(&output.stdout);
            let (stderr, err_trunc) = cap_output(&output.stderr);
            CommandOutput {
                command: invocation.command.clone(),
                args: invocation.args.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
                truncated: out_trunc || err_trunc,
                timed_out: false,
            }
        }
    }
}

fn cap_output(bytes: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURE_BYTES {
        return (text.into_owned(), false);
    }
    let mut end = MAX_CAPTURE_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

fn is_clean_absolute(path: &str) -> bool {
    let p = Path::new(path);
    p.is_absolute()
        && p.components()
            .all(|c| !matches!(c, Component::CurDir | Component::ParentDir))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patze_proto::{TargetOrigin, TargetPurpose, TargetType};
    use patze_sync::NewTarget;

    fn fixture(tmp: &Path, allowed: &str) -> (ConfigCommandQueue, String, PathBuf) {
        let home = tmp.join("home");
        let dir = home.join(".openclaw");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("openclaw.json"), "{\"a\":1}").expect("seed config");

        let targets = Arc::new(TargetStore::new(&tmp.join("cron-store"), home));
        let target = targets
            .create(NewTarget {
                label: "local".to_string(),
                target_type: TargetType::Local,
                origin: TargetOrigin::User,
                purpose: TargetPurpose::Production,
                openclaw_dir: dir.to_string_lossy().into_owned(),
                poll_interval_ms: None,
            })
            .expect("create target");

        let queue = ConfigCommandQueue::with_allowed_binary(targets, &tmp.join("state"), allowed);
        (queue, target.id, dir)
    }

    fn shell(script: &str, description: &str) -> CliInvocation {
        CliInvocation {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            description: description.to_string(),
        }
    }

    #[test]
    fn test_blocked_binary_rejected_at_queue_time() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, _dir) = fixture(tmp.path(), ALLOWED_BINARY);

        let err = queue
            .queue_command(
                &target_id,
                CliInvocation {
                    command: "/bin/sh".to_string(),
                    args: vec![],
                    description: "sneaky".to_string(),
                },
            )
            .expect_err("blocked");
        assert!(matches!(err, ApplyError::CommandBlocked(_)));
        assert!(queue.pending(&target_id).is_empty());
    }

    #[test]
    fn test_relative_override_falls_back_to_default() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, _dir) = fixture(tmp.path(), "bin/../sh");
        // The unsafe override was discarded, so only `openclaw` passes.
        let err = queue
            .queue_command(&target_id, shell("true", "x"))
            .expect_err("blocked");
        assert!(matches!(err, ApplyError::CommandBlocked(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_commits_on_success() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, dir) = fixture(tmp.path(), "/bin/sh");

        queue
            .queue_command(&target_id, shell("printf '{\"a\":2}' > openclaw.json", "set a=2"))
            .expect("queue");
        let result = queue.apply(&target_id, "test").await.expect("apply");
        assert!(result.ok);
        assert_eq!(std::fs::read(dir.join("openclaw.json")).expect("read"), b"{\"a\":2}");
        // Pending list is consumed on success.
        assert!(queue.pending(&target_id).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_rolls_back_byte_identical_on_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, dir) = fixture(tmp.path(), "/bin/sh");

        queue
            .queue_command(&target_id, shell("printf '{\"a\":2}' > openclaw.json", "mutate"))
            .expect("queue");
        queue
            .queue_command(&target_id, shell("exit 3", "fail"))
            .expect("queue");

        let result = queue.apply(&target_id, "test").await.expect("apply");
        assert!(!result.ok);
        assert!(result.error.is_some());
        // Byte-for-byte restore of the pre-apply contents.
        assert_eq!(std::fs::read(dir.join("openclaw.json")).expect("read"), b"{\"a\":1}");
        // Failed applies keep the queue for correction.
        assert_eq!(queue.pending(&target_id).len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preview_leaves_real_config_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, dir) = fixture(tmp.path(), "/bin/sh");

        queue
            .queue_command(&target_id, shell("printf '{\"a\":9}' > openclaw.json", "sandbox edit"))
            .expect("queue");
        let preview = queue.preview(&target_id).await.expect("preview");

        assert!(preview.simulated);
        assert_eq!(preview.command_count, 1);
        assert!(preview.changed);
        assert_eq!(preview.before, "{\"a\":1}");
        assert_eq!(preview.after, "{\"a\":9}");
        assert_eq!(std::fs::read(dir.join("openclaw.json")).expect("read"), b"{\"a\":1}");
        // Preview never consumes the queue.
        assert_eq!(queue.pending(&target_id).len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rollback_to_snapshot_with_guard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, target_id, dir) = fixture(tmp.path(), "/bin/sh");

        queue
            .queue_command(&target_id, shell("printf '{\"a\":2}' > openclaw.json", "set a=2"))
            .expect("queue");
        let applied = queue.apply(&target_id, "test").await.expect("apply");
        assert!(applied.ok);

        // Roll back to the pre-apply snapshot; a guard snapshot appears.
        let before_count = queue.list_snapshots(&target_id).len();
        queue.rollback_to_snapshot(&applied.snapshot_id).expect("rollback");
        assert_eq!(std::fs::read(dir.join("openclaw.json")).expect("read"), b"{\"a\":1}");
        assert_eq!(queue.list_snapshots(&target_id).len(), before_count + 1);
    }

    #[test]
    fn test_rollback_unknown_snapshot() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (queue, _target_id, _dir) = fixture(tmp.path(), "/bin/sh");
        assert!(matches!(
            queue.rollback_to_snapshot("snap-none"),
            Err(ApplyError::SnapshotNotFound(_))
        ));
    }
}
