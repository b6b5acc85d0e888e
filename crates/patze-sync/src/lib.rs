//! OpenClaw target store and cron-spool sync.
//!
//! Persists the set of known OpenClaw targets, polls each enabled target's
//! filesystem spool for jobs and run history, and exposes per-target sync
//! status. Remote targets get their spool written by bridge check-ins
//! through [`spool::apply_cron_sync`].

#![forbid(unsafe_code)]

pub mod manager;
pub mod safety;
pub mod spool;
pub mod targets;

pub use manager::{MergedScheduleEntry, RUN_HISTORY_CAP, SyncManager, SyncStatusUpdate};
pub use safety::{DirSafetyError, safe_job_id, validate_openclaw_dir};
pub use spool::{CronSyncApplied, apply_cron_sync, config_hash, current_config_hash};
pub use targets::{DEFAULT_POLL_INTERVAL_MS, NewTarget, TargetError, TargetPatch, TargetStore};
