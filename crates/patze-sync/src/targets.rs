//! Persistent store of OpenClaw targets.
//!
//! Targets live in one JSON file under the cron store directory and every
//! save is an atomic replace. Targets are created by the operator or
//! auto-created on a bridge's first check-in.

use crate::safety::{DirSafetyError, validate_openclaw_dir};
use chrono::Utc;
use parking_lot::Mutex;
use patze_persist::write_atomic;
use patze_proto::{OpenClawTarget, TargetOrigin, TargetPurpose, TargetType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
const MIN_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("target '{0}' not found")]
    NotFound(String),
    #[error("smoke targets must have purpose=test")]
    SmokeMustBeTest,
    #[error(transparent)]
    UnsafeDir(#[from] DirSafetyError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTarget {
    pub label: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub origin: TargetOrigin,
    pub purpose: TargetPurpose,
    pub openclaw_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

pub struct TargetStore {
    path: PathBuf,
    home: PathBuf,
    inner: Mutex<HashMap<String, OpenClawTarget>>,
}

impl TargetStore {
    /// Open the store at `<cron_store_dir>/targets.json`. `home` anchors
    /// directory-safety checks (injectable for tests).
    pub fn new(cron_store_dir: &Path, home: PathBuf) -> Self {
        let path = cron_store_dir.join("targets.json");
        let targets: HashMap<String, OpenClawTarget> = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt targets file, starting fresh");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        info!(count = targets.len(), "loaded targets");
        Self {
            path,
            home,
            inner: Mutex::new(targets),
        }
    }

    pub fn create(&self, new: NewTarget) -> Result<OpenClawTarget, TargetError> {
        if new.origin == TargetOrigin::Smoke && new.purpose != TargetPurpose::Test {
            return Err(TargetError::SmokeMustBeTest);
        }
        let dir = validate_openclaw_dir(&new.openclaw_dir, &self.home)?;

        let now = Utc::now();
        let target = OpenClawTarget {
            id: patze_proto::prefixed_id("tgt"),
            label: new.label,
            target_type: new.target_type,
            origin: new.origin,
            purpose: new.purpose,
            openclaw_dir: dir.to_string_lossy().into_owned(),
            poll_interval_ms: new
                .poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
                .max(MIN_POLL_INTERVAL_MS),
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock();
        inner.insert(target.id.clone(), target.clone());
        self.persist(&inner);
        info!(target_id = %target.id, dir = %target.openclaw_dir, "target created");
        Ok(target)
    }

    /// Find a target for a bridge's first check-in, or auto-create one.
    /// Matching is by machine-id substring in `openclawDir` (the convention
    /// bridges use when laying out per-machine spools), falling back to the
    /// most recently updated remote target.
    pub fn ensure_auto_target(
        &self,
        machine_id: &str,
        machine_label: Option<&str>,
    ) -> Result<OpenClawTarget, TargetError> {
        {
            let inner = self.inner.lock();
            let mut candidates: Vec<&OpenClawTarget> = inner
                .values()
                .filter(|t| t.target_type == TargetType::Remote)
                .collect();
            candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            if let Some(by_dir) = candidates.iter().find(|t| t.openclaw_dir.contains(machine_id)) {
                return Ok((*by_dir).clone());
            }
        }

        self.create(NewTarget {
            label: machine_label.unwrap_or(machine_id).to_string(),
            target_type: TargetType::Remote,
            origin: TargetOrigin::Auto,
            purpose: TargetPurpose::Production,
            openclaw_dir: format!(
                "{}/bridges/{machine_id}",
                self.home.join(".patze-control").to_string_lossy()
            ),
            poll_interval_ms: None,
        })
    }

    pub fn update(&self, id: &str, patch: TargetPatch) -> Result<OpenClawTarget, TargetError> {
        let mut inner = self.inner.lock();
        let target = inner
            .get_mut(id)
            .ok_or_else(|| TargetError::NotFound(id.to_string()))?;

        if let Some(label) = patch.label {
            target.label = label;
        }
        if let Some(interval) = patch.poll_interval_ms {
            target.poll_interval_ms = interval.max(MIN_POLL_INTERVAL_MS);
        }
        if let Some(enabled) = patch.enabled {
            target.enabled = enabled;
        }
        target.updated_at = Utc::now();
        let updated = target.clone();
        self.persist(&inner);
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<OpenClawTarget, TargetError> {
        let mut inner = self.inner.lock();
        let removed = inner
            .remove(id)
            .ok_or_else(|| TargetError::NotFound(id.to_string()))?;
        self.persist(&inner);
        info!(target_id = %id, "target removed");
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<OpenClawTarget> {
        self.inner.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<OpenClawTarget> {
        let inner = self.inner.lock();
        let mut out: Vec<OpenClawTarget> = inner.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn persist(&self, inner: &HashMap<String, OpenClawTarget>) {
        match serde_json::to_vec_pretty(inner) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path, &bytes) {
                    warn!(error = %e, "failed to persist targets");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize targets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> TargetStore {
        let home = dir.join("home");
        std::fs::create_dir_all(&home).expect("mkdir");
        TargetStore::new(&dir.join("cron-store"), home)
    }

    fn new_target(dir: &Path, label: &str) -> NewTarget {
        NewTarget {
            label: label.to_string(),
            target_type: TargetType::Local,
            origin: TargetOrigin::User,
            purpose: TargetPurpose::Production,
            openclaw_dir: dir
                .join("home")
                .join(".openclaw")
                .to_string_lossy()
                .into_owned(),
            poll_interval_ms: Some(5_000),
        }
    }

    #[test]
    fn test_create_and_reload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let id = {
            let targets = store(tmp.path());
            targets.create(new_target(tmp.path(), "primary")).expect("create").id
        };

        let reopened = store(tmp.path());
        let target = reopened.get(&id).expect("reloaded");
        assert_eq!(target.label, "primary");
        assert!(target.enabled);
    }

    #[test]
    fn test_smoke_invariant_enforced() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let targets = store(tmp.path());
        let mut new = new_target(tmp.path(), "smoke");
        new.origin = TargetOrigin::Smoke;
        assert_eq!(
            targets.create(new).expect_err("rejected"),
            TargetError::SmokeMustBeTest
        );
    }

    #[test]
    fn test_unsafe_dir_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let targets = store(tmp.path());
        let mut new = new_target(tmp.path(), "bad");
        new.openclaw_dir = "/etc/openclaw".to_string();
        assert!(matches!(targets.create(new), Err(TargetError::UnsafeDir(_))));
    }

    #[test]
    fn test_ensure_auto_target_matches_dir_then_creates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let targets = store(tmp.path());

        let created = targets.ensure_auto_target("m-abc", Some("builder")).expect("auto");
        assert_eq!(created.origin, TargetOrigin::Auto);
        assert!(created.openclaw_dir.contains("m-abc"));

        // Second check-in for the same machine resolves to the same target.
        let again = targets.ensure_auto_target("m-abc", None).expect("auto");
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn test_update_patch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let targets = store(tmp.path());
        let target = targets.create(new_target(tmp.path(), "t")).expect("create");

        let updated = targets
            .update(
                &target.id,
                TargetPatch {
                    label: Some("renamed".to_string()),
                    poll_interval_ms: Some(10),
                    enabled: Some(false),
                },
            )
            .expect("update");
        assert_eq!(updated.label, "renamed");
        // Interval clamped to the floor.
        assert_eq!(updated.poll_interval_ms, 1_000);
        assert!(!updated.enabled);
        assert!(updated.updated_at >= target.updated_at);
    }

    #[test]
    fn test_remove_unknown() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let targets = store(tmp.path());
        assert!(matches!(targets.remove("tgt-x"), Err(TargetError::NotFound(_))));
    }
}
