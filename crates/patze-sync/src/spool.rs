//! Cron spool I/O: the on-disk contract shared with bridge agents.
//!
//! Layout under one `openclawDir`:
//! - `cron/jobs.json` — atomic replace
//! - `cron/runs/<safe(jobId)>.jsonl` — append-only run history
//! - `openclaw.json` (or `config/openclaw.json`) — primary config
//!
//! Applying the same check-in twice leaves the directory byte-identical:
//! every write is skipped when the incoming bytes already match the file.

use crate::safety::safe_job_id;
use patze_proto::{BridgeCronSyncRequest, CronJobsFile, CronRunRecord, OpenClawCronJob};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stable hash over config bytes. An absent or empty config hashes as `{}`
/// so that "no file yet" and "freshly initialized" agree.
pub fn config_hash(bytes: &[u8]) -> String {
    let effective: &[u8] = if bytes.is_empty() { b"{}" } else { bytes };
    hex::encode(Sha256::digest(effective))
}

/// Resolve the config file inside an OpenClaw dir: `openclaw.json`, with
/// `config/openclaw.json` as the alternate location.
pub fn config_path(openclaw_dir: &Path) -> PathBuf {
    let primary = openclaw_dir.join("openclaw.json");
    if primary.exists() {
        return primary;
    }
    let alternate = openclaw_dir.join("config").join("openclaw.json");
    if alternate.exists() { alternate } else { primary }
}

/// Current config bytes, or empty when no config exists yet.
pub fn read_config(openclaw_dir: &Path) -> Vec<u8> {
    std::fs::read(config_path(openclaw_dir)).unwrap_or_default()
}

/// Hash of the target's current on-disk config.
pub fn current_config_hash(openclaw_dir: &Path) -> String {
    config_hash(&read_config(openclaw_dir))
}

pub fn jobs_path(openclaw_dir: &Path) -> PathBuf {
    openclaw_dir.join("cron").join("jobs.json")
}

pub fn runs_path(openclaw_dir: &Path, job_id: &str) -> PathBuf {
    openclaw_dir
        .join("cron")
        .join("runs")
        .join(format!("{}.jsonl", safe_job_id(job_id)))
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSyncApplied {
    pub jobs_applied: bool,
    pub config_applied: bool,
    pub run_delta_jobs: usize,
}

/// Apply one bridge check-in to the spool. Jobs and config are rewritten
/// only when the incoming content differs from what is on disk, and run
/// records are appended per job.
pub fn apply_cron_sync(
    openclaw_dir: &Path,
    request: &BridgeCronSyncRequest,
) -> std::io::Result<CronSyncApplied> {
    let mut applied = CronSyncApplied::default();

    if let Some(jobs) = &request.jobs {
        applied.jobs_applied = write_jobs(openclaw_dir, jobs)?;
    }

    if let Some(config_raw) = &request.config_raw {
        let path = config_path(openclaw_dir);
        let current = std::fs::read(&path).unwrap_or_default();
        if current != config_raw.as_bytes() {
            patze_persist::write_atomic(&path, config_raw.as_bytes())?;
            applied.config_applied = true;
        }
    }

    for (job_id, records) in &request.new_runs {
        if records.is_empty() {
            continue;
        }
        let path = runs_path(openclaw_dir, job_id);
        for record in records {
            patze_persist::append_jsonl(&path, record)?;
        }
        applied.run_delta_jobs += 1;
    }

    debug!(
        dir = %openclaw_dir.display(),
        jobs_applied = applied.jobs_applied,
        config_applied = applied.config_applied,
        run_delta_jobs = applied.run_delta_jobs,
        "cron-sync applied"
    );
    Ok(applied)
}

/// Write `cron/jobs.json` if the serialized content differs. Returns
/// whether a write happened.
pub fn write_jobs(openclaw_dir: &Path, jobs: &[OpenClawCronJob]) -> std::io::Result<bool> {
    let file = CronJobsFile {
        version: 1,
        jobs: jobs.to_vec(),
    };
    let bytes = serde_json::to_vec_pretty(&file).map_err(std::io::Error::other)?;
    let path = jobs_path(openclaw_dir);
    let current = std::fs::read(&path).unwrap_or_default();
    if current == bytes {
        return Ok(false);
    }
    patze_persist::write_atomic(&path, &bytes)?;
    Ok(true)
}

/// Read `cron/jobs.json`. A missing file is an empty job list; a corrupt
/// file is an error the sync tick counts as a failure.
pub fn read_jobs(openclaw_dir: &Path) -> Result<Vec<OpenClawCronJob>, String> {
    let path = jobs_path(openclaw_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(format!("jobs file unreadable: {}", e.kind())),
    };
    let file: CronJobsFile =
        serde_json::from_str(&content).map_err(|e| format!("jobs file malformed: line {}", e.line()))?;
    Ok(file.jobs)
}

/// Forward-only read of a job's run history since `offset`.
pub fn read_run_delta(
    openclaw_dir: &Path,
    job_id: &str,
    offset: u64,
) -> std::io::Result<(Vec<CronRunRecord>, u64)> {
    patze_persist::JsonlReader::read_from(&runs_path(openclaw_dir, job_id), offset)
}
