//! Durable bridge command queue.
//!
//! Commands flow `queued → leased → running → succeeded|failed`, with
//! `rejected` and `deadletter` as the off-ramps. Bridges pull work over the
//! long-poll surface; this store owns every transition and serializes them
//! per command under one lock. Mutating intents are gated behind operator
//! approval, and approval re-checks the target's config hash so a command
//! can never apply against a config it was not reviewed for.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use patze_persist::JsonStore;
use patze_proto::{
    BridgeCommand, CommandIntent, CommandResultPayload, CommandSnapshot, CommandState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Stdout/stderr cap applied to every stored result.
pub const MAX_OUTPUT_BYTES: usize = 32 * 1024;
/// Lease expiries beyond this attempt count move the command to deadletter.
pub const MAX_LEASE_ATTEMPTS: u32 = 3;

const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
const MIN_LEASE_TTL_MS: u64 = 5_000;
const MAX_LEASE_TTL_MS: u64 = 600_000;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command '{0}' not found")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("target version mismatch")]
    TargetVersionMismatch,
    #[error("machine '{0}' does not own this lease")]
    NotOwner(String),
    #[error("command does not require approval")]
    ApprovalNotRequired,
}

// ─── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub target_id: String,
    pub machine_id: String,
    /// Config hash of the target at enqueue time.
    pub target_version: String,
    pub intent: CommandIntent,
    pub args: Vec<String>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub policy_version: u32,
}

/// Result of applying a bridge-reported result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultOutcome {
    pub command: BridgeCommand,
    pub duplicate: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryReport {
    pub requeued: Vec<String>,
    pub deadlettered: Vec<String>,
}

// ─── Mutation detection ───────────────────────────────────────────────────────

const MUTATION_ARG_PAIRS: &[(&str, &[&str])] = &[
    ("config", &["set", "unset"]),
    ("agents", &["add", "remove"]),
    ("models", &["add", "remove"]),
    ("channels", &["set", "unbind"]),
];

/// Whether a command intent + args mutate remote configuration and therefore
/// require operator approval before a bridge may lease them.
pub fn has_mutation_args(intent: CommandIntent, args: &[String]) -> bool {
    match intent {
        CommandIntent::AgentSetEnabled => true,
        CommandIntent::TriggerJob | CommandIntent::ApproveRequest => false,
        CommandIntent::RunCommand => args.windows(2).any(|pair| {
            MUTATION_ARG_PAIRS
                .iter()
                .any(|(noun, verbs)| pair[0] == *noun && verbs.contains(&pair[1].as_str()))
        }),
    }
}

/// Truncate to at most `max_bytes` on a char boundary.
fn sanitize_output(s: &str, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

// ─── Store ────────────────────────────────────────────────────────────────────

struct Inner {
    commands: HashMap<String, BridgeCommand>,
    /// Enqueue order per `(target_id, machine_id)`.
    order: HashMap<(String, String), Vec<String>>,
    /// Idempotency key → command id, for terminal succeeded/failed commands.
    completed_by_key: HashMap<String, String>,
}

pub struct CommandStore {
    inner: Mutex<Inner>,
    store: JsonStore,
}

impl CommandStore {
    /// Open the store, replaying any persisted commands.
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "bridge_commands");
        let commands: HashMap<String, BridgeCommand> = store.load();

        let mut order: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut completed_by_key = HashMap::new();
        let mut ids: Vec<&BridgeCommand> = commands.values().collect();
        ids.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        for command in ids {
            order
                .entry((command.snapshot.target_id.clone(), command.snapshot.machine_id.clone()))
                .or_default()
                .push(command.id.clone());
            if matches!(command.state, CommandState::Succeeded | CommandState::Failed)
                && !command.snapshot.idempotency_key.is_empty()
            {
                completed_by_key.insert(command.snapshot.idempotency_key.clone(), command.id.clone());
            }
        }

        info!(count = commands.len(), "loaded bridge commands from disk");
        Self {
            inner: Mutex::new(Inner {
                commands,
                order,
                completed_by_key,
            }),
            store,
        }
    }

    /// Enqueue a command. Re-enqueueing an idempotency key that is already
    /// known returns the existing command instead of queueing a twin.
    pub fn enqueue(&self, request: EnqueueRequest) -> BridgeCommand {
        let mut inner = self.inner.lock();

        if let Some(key) = request.idempotency_key.as_deref().filter(|k| !k.is_empty())
            && let Some(existing) = inner
                .commands
                .values()
                .find(|c| c.snapshot.idempotency_key == key)
        {
            return existing.clone();
        }

        let approval_required = has_mutation_args(request.intent, &request.args);
        let command = BridgeCommand {
            id: patze_proto::prefixed_id("cmd"),
            snapshot: CommandSnapshot {
                target_id: request.target_id.clone(),
                machine_id: request.machine_id.clone(),
                target_version: request.target_version,
                intent: request.intent,
                args: request.args,
                created_by: request.created_by,
                idempotency_key: request.idempotency_key.unwrap_or_default(),
                approval_required,
                policy_version: request.policy_version,
            },
            state: CommandState::Queued,
            created_at: Utc::now(),
            lease_expires_at: None,
            owner_machine_id: None,
            attempts: 0,
            result: None,
            approved_by: None,
            approved_at: None,
            rejected_reason: None,
        };

        inner
            .order
            .entry((request.target_id, request.machine_id))
            .or_default()
            .push(command.id.clone());
        inner.commands.insert(command.id.clone(), command.clone());
        self.persist(&inner);
        info!(command_id = %command.id, approval_required, "command enqueued");
        command
    }

    /// Record operator approval. The supplied target version must match the
    /// target's current config hash.
    pub fn approve(
        &self,
        id: &str,
        approver: &str,
        target_version: &str,
        current_target_version: &str,
    ) -> Result<BridgeCommand, CommandError> {
        let mut inner = self.inner.lock();
        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        if !command.snapshot.approval_required {
            return Err(CommandError::ApprovalNotRequired);
        }
        if command.state != CommandState::Queued {
            return Err(CommandError::InvalidTransition(format!(
                "cannot approve command in state {:?}",
                command.state
            )));
        }
        if target_version != current_target_version {
            return Err(CommandError::TargetVersionMismatch);
        }

        command.approved_by = Some(approver.to_string());
        command.approved_at = Some(Utc::now());
        let approved = command.clone();
        self.persist(&inner);
        info!(command_id = %id, approver, "command approved");
        Ok(approved)
    }

    /// Lease the first eligible command for a machine, FIFO per queue and
    /// oldest-first across targets. Commands awaiting approval are skipped.
    pub fn poll(&self, machine_id: &str, lease_ttl_ms: Option<u64>) -> Option<BridgeCommand> {
        let now = Utc::now();
        let ttl = lease_ttl_ms
            .unwrap_or(DEFAULT_LEASE_TTL_MS)
            .clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS);

        let mut inner = self.inner.lock();

        let mut candidate: Option<(DateTime<Utc>, String)> = None;
        for ((_, queue_machine), ids) in inner.order.iter() {
            if queue_machine != machine_id {
                continue;
            }
            let eligible = ids.iter().find_map(|id| {
                let command = inner.commands.get(id)?;
                let leasable = command.state == CommandState::Queued
                    && (!command.snapshot.approval_required || command.approved_by.is_some());
                leasable.then(|| (command.created_at, command.id.clone()))
            });
            if let Some((created_at, id)) = eligible
                && candidate.as_ref().is_none_or(|(best, _)| created_at < *best)
            {
                candidate = Some((created_at, id));
            }
        }

        let (_, id) = candidate?;
        let command = inner.commands.get_mut(&id)?;
        command.state = CommandState::Leased;
        command.owner_machine_id = Some(machine_id.to_string());
        command.lease_expires_at = Some(now + Duration::milliseconds(ttl as i64));
        let leased = command.clone();
        self.persist(&inner);
        info!(command_id = %id, machine_id, ttl_ms = ttl, "command leased");
        Some(leased)
    }

    /// Bridge acknowledges the lease and starts executing.
    pub fn ack(&self, id: &str, machine_id: &str) -> Result<BridgeCommand, CommandError> {
        let mut inner = self.inner.lock();
        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        check_owner(command, machine_id)?;
        if command.state != CommandState::Leased {
            return Err(CommandError::InvalidTransition(format!(
                "cannot ack command in state {:?}",
                command.state
            )));
        }
        command.state = CommandState::Running;
        let running = command.clone();
        self.persist(&inner);
        Ok(running)
    }

    /// Extend the lease. Valid from leased or running, owner only.
    pub fn heartbeat(
        &self,
        id: &str,
        machine_id: &str,
        lease_ttl_ms: Option<u64>,
    ) -> Result<BridgeCommand, CommandError> {
        let ttl = lease_ttl_ms
            .unwrap_or(DEFAULT_LEASE_TTL_MS)
            .clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS);

        let mut inner = self.inner.lock();
        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        check_owner(command, machine_id)?;
        if !matches!(command.state, CommandState::Leased | CommandState::Running) {
            return Err(CommandError::InvalidTransition(format!(
                "cannot heartbeat command in state {:?}",
                command.state
            )));
        }
        command.lease_expires_at = Some(Utc::now() + Duration::milliseconds(ttl as i64));
        let updated = command.clone();
        self.persist(&inner);
        Ok(updated)
    }

    /// Apply a bridge-reported result. At-most-once: a repeat result for a
    /// terminal command from its owner returns `duplicate=true` without
    /// re-applying, as does a result whose idempotency key was already
    /// completed by another command.
    pub fn result(
        &self,
        id: &str,
        machine_id: &str,
        mut payload: CommandResultPayload,
    ) -> Result<ResultOutcome, CommandError> {
        let mut inner = self.inner.lock();

        let already_completed_key = {
            let command = inner
                .commands
                .get(id)
                .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

            if matches!(command.state, CommandState::Succeeded | CommandState::Failed) {
                let owner_matches = command.owner_machine_id.as_deref() == Some(machine_id);
                if owner_matches {
                    return Ok(ResultOutcome {
                        command: command.clone(),
                        duplicate: true,
                    });
                }
                return Err(CommandError::NotOwner(machine_id.to_string()));
            }

            check_owner(command, machine_id)?;
            if !matches!(command.state, CommandState::Leased | CommandState::Running) {
                return Err(CommandError::InvalidTransition(format!(
                    "cannot apply result to command in state {:?}",
                    command.state
                )));
            }

            let key = &command.snapshot.idempotency_key;
            !key.is_empty()
                && inner
                    .completed_by_key
                    .get(key)
                    .is_some_and(|done_id| done_id != id)
        };

        let (stdout, out_truncated) = sanitize_output(&payload.stdout, MAX_OUTPUT_BYTES);
        let (stderr, err_truncated) = sanitize_output(&payload.stderr, MAX_OUTPUT_BYTES);
        payload.stdout = stdout;
        payload.stderr = stderr;
        payload.truncated = payload.truncated || out_truncated || err_truncated;
        payload.duplicate = already_completed_key;

        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;
        command.state = match payload.status {
            patze_proto::CommandOutcome::Ok => CommandState::Succeeded,
            patze_proto::CommandOutcome::Error | patze_proto::CommandOutcome::Timeout => {
                CommandState::Failed
            }
        };
        command.lease_expires_at = None;
        command.result = Some(payload);
        let done = command.clone();

        if !done.snapshot.idempotency_key.is_empty() && !already_completed_key {
            inner
                .completed_by_key
                .insert(done.snapshot.idempotency_key.clone(), done.id.clone());
        }
        self.persist(&inner);
        info!(command_id = %id, state = ?done.state, duplicate = already_completed_key, "result applied");
        Ok(ResultOutcome {
            command: done,
            duplicate: already_completed_key,
        })
    }

    /// System-initiated rejection, valid until a command goes terminal.
    pub fn reject(&self, id: &str, reason: &str) -> Result<BridgeCommand, CommandError> {
        let mut inner = self.inner.lock();
        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        if command.state.is_terminal() {
            return Err(CommandError::InvalidTransition(format!(
                "cannot reject command in state {:?}",
                command.state
            )));
        }
        command.state = CommandState::Rejected;
        command.rejected_reason = Some(reason.to_string());
        command.lease_expires_at = None;
        let rejected = command.clone();
        self.persist(&inner);
        warn!(command_id = %id, reason, "command rejected");
        Ok(rejected)
    }

    /// Return expired leases to the queue, or deadletter them once the
    /// attempt budget is spent. Driven by the lease timer task.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> ExpiryReport {
        let mut inner = self.inner.lock();
        let mut report = ExpiryReport::default();

        for command in inner.commands.values_mut() {
            if !matches!(command.state, CommandState::Leased | CommandState::Running) {
                continue;
            }
            let Some(expires_at) = command.lease_expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }

            command.attempts += 1;
            command.owner_machine_id = None;
            command.lease_expires_at = None;
            if command.attempts >= MAX_LEASE_ATTEMPTS {
                command.state = CommandState::Deadletter;
                report.deadlettered.push(command.id.clone());
                warn!(command_id = %command.id, attempts = command.attempts, "command deadlettered");
            } else {
                command.state = CommandState::Queued;
                report.requeued.push(command.id.clone());
            }
        }

        if !report.requeued.is_empty() || !report.deadlettered.is_empty() {
            self.persist(&inner);
        }
        report
    }

    pub fn get(&self, id: &str) -> Option<BridgeCommand> {
        self.inner.lock().commands.get(id).cloned()
    }

    pub fn list(&self, target_id: Option<&str>) -> Vec<BridgeCommand> {
        let inner = self.inner.lock();
        let mut out: Vec<BridgeCommand> = inner
            .commands
            .values()
            .filter(|c| target_id.is_none_or(|t| c.snapshot.target_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    fn persist(&self, inner: &Inner) {
        if let Err(e) = self.store.save(&inner.commands) {
            warn!(error = %e, "failed to snapshot command store");
        }
    }
}

fn check_owner(command: &BridgeCommand, machine_id: &str) -> Result<(), CommandError> {
    if command.owner_machine_id.as_deref() != Some(machine_id) {
        return Err(CommandError::NotOwner(machine_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use patze_proto::CommandOutcome;

    fn store() -> (CommandStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CommandStore::new(dir.path());
        (store, dir)
    }

    fn request(args: &[&str]) -> EnqueueRequest {
        EnqueueRequest {
            target_id: "t-1".to_string(),
            machine_id: "m-1".to_string(),
            target_version: "hash-a".to_string(),
            intent: CommandIntent::RunCommand,
            args: args.iter().map(|s| s.to_string()).collect(),
            created_by: "operator".to_string(),
            idempotency_key: None,
            policy_version: 1,
        }
    }

    fn ok_result() -> CommandResultPayload {
        CommandResultPayload {
            status: CommandOutcome::Ok,
            exit_code: 0,
            duration_ms: 120,
            stdout: "done".to_string(),
            stderr: String::new(),
            truncated: false,
            artifact: None,
            duplicate: false,
        }
    }

    #[test]
    fn test_mutation_detection() {
        let to_args = |s: &str| s.split(' ').map(str::to_string).collect::<Vec<_>>();
        assert!(has_mutation_args(CommandIntent::RunCommand, &to_args("openclaw config set foo bar")));
        assert!(has_mutation_args(CommandIntent::RunCommand, &to_args("openclaw agents remove a1")));
        assert!(has_mutation_args(CommandIntent::RunCommand, &to_args("openclaw channels unbind c1")));
        assert!(!has_mutation_args(CommandIntent::RunCommand, &to_args("openclaw config get foo")));
        assert!(!has_mutation_args(CommandIntent::RunCommand, &to_args("openclaw status")));
        assert!(has_mutation_args(CommandIntent::AgentSetEnabled, &[]));
        assert!(!has_mutation_args(CommandIntent::TriggerJob, &to_args("config set x")));
        assert!(!has_mutation_args(CommandIntent::ApproveRequest, &[]));
    }

    #[test]
    fn test_full_lifecycle() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        assert!(!command.snapshot.approval_required);

        let leased = store.poll("m-1", Some(10_000)).expect("leased");
        assert_eq!(leased.id, command.id);
        assert_eq!(leased.state, CommandState::Leased);

        let running = store.ack(&command.id, "m-1").expect("ack");
        assert_eq!(running.state, CommandState::Running);

        store.heartbeat(&command.id, "m-1", None).expect("heartbeat");

        let outcome = store.result(&command.id, "m-1", ok_result()).expect("result");
        assert_eq!(outcome.command.state, CommandState::Succeeded);
        assert!(!outcome.duplicate);
    }

    #[test]
    fn test_approval_gate_blocks_poll() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "config", "set", "foo", "bar"]));
        assert!(command.snapshot.approval_required);

        // Unapproved mutating command is never leased.
        assert!(store.poll("m-1", None).is_none());

        // Approval with the wrong target version fails.
        let err = store
            .approve(&command.id, "operator", "stale-hash", "hash-a")
            .expect_err("mismatch");
        assert_eq!(err, CommandError::TargetVersionMismatch);
        assert!(store.poll("m-1", None).is_none());

        store
            .approve(&command.id, "operator", "hash-a", "hash-a")
            .expect("approve");
        let leased = store.poll("m-1", None).expect("leased after approval");
        assert_eq!(leased.id, command.id);
    }

    #[test]
    fn test_fifo_order_per_queue() {
        let (store, _dir) = store();
        let first = store.enqueue(request(&["openclaw", "status"]));
        let _second = store.enqueue(request(&["openclaw", "doctor"]));

        let leased = store.poll("m-1", None).expect("leased");
        assert_eq!(leased.id, first.id);
    }

    #[test]
    fn test_poll_wrong_machine_gets_nothing() {
        let (store, _dir) = store();
        store.enqueue(request(&["openclaw", "status"]));
        assert!(store.poll("m-other", None).is_none());
    }

    #[test]
    fn test_owner_enforced() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        store.poll("m-1", None).expect("leased");

        assert!(matches!(
            store.ack(&command.id, "m-2"),
            Err(CommandError::NotOwner(_))
        ));
        assert!(matches!(
            store.result(&command.id, "m-2", ok_result()),
            Err(CommandError::NotOwner(_))
        ));
    }

    #[test]
    fn test_repeat_result_is_duplicate() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        store.poll("m-1", None).expect("leased");
        store.ack(&command.id, "m-1").expect("ack");
        store.result(&command.id, "m-1", ok_result()).expect("first result");

        let repeat = store.result(&command.id, "m-1", ok_result()).expect("repeat");
        assert!(repeat.duplicate);
        assert_eq!(repeat.command.state, CommandState::Succeeded);
    }

    #[test]
    fn test_idempotency_key_dedup_across_commands() {
        let (store, _dir) = store();
        let mut req = request(&["openclaw", "trigger"]);
        req.idempotency_key = Some("idem-1".to_string());
        let first = store.enqueue(req.clone());

        // Same key re-enqueued returns the existing command.
        let again = store.enqueue(req);
        assert_eq!(again.id, first.id);
    }

    #[test]
    fn test_lease_expiry_requeues_then_deadletters() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));

        for attempt in 1..=MAX_LEASE_ATTEMPTS {
            let leased = store.poll("m-1", Some(MIN_LEASE_TTL_MS)).expect("leased");
            assert_eq!(leased.id, command.id);

            let past_expiry = Utc::now() + Duration::milliseconds(MAX_LEASE_TTL_MS as i64);
            let report = store.expire_leases(past_expiry);
            if attempt < MAX_LEASE_ATTEMPTS {
                assert_eq!(report.requeued, vec![command.id.clone()]);
            } else {
                assert_eq!(report.deadlettered, vec![command.id.clone()]);
            }
        }

        let dead = store.get(&command.id).expect("command");
        assert_eq!(dead.state, CommandState::Deadletter);
        // Terminal: no further transitions.
        assert!(store.poll("m-1", None).is_none());
        assert!(store.reject(&command.id, "late").is_err());
    }

    #[test]
    fn test_heartbeat_extends_lease() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        let leased = store.poll("m-1", Some(MIN_LEASE_TTL_MS)).expect("leased");
        let first_expiry = leased.lease_expires_at.expect("lease");

        let extended = store
            .heartbeat(&command.id, "m-1", Some(MAX_LEASE_TTL_MS))
            .expect("heartbeat");
        assert!(extended.lease_expires_at.expect("lease") > first_expiry);

        // No expiry while the heartbeat keeps the lease fresh.
        let report = store.expire_leases(Utc::now());
        assert!(report.requeued.is_empty());
        assert!(report.deadlettered.is_empty());
    }

    #[test]
    fn test_output_sanitization() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        store.poll("m-1", None).expect("leased");
        store.ack(&command.id, "m-1").expect("ack");

        let mut payload = ok_result();
        payload.stdout = "é".repeat(MAX_OUTPUT_BYTES); // 2 bytes per char
        let outcome = store.result(&command.id, "m-1", payload).expect("result");
        let result = outcome.command.result.expect("result stored");
        assert!(result.truncated);
        assert!(result.stdout.len() <= MAX_OUTPUT_BYTES);
        // UTF-8 safe: still valid on the boundary.
        assert!(result.stdout.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_reject_records_reason() {
        let (store, _dir) = store();
        let command = store.enqueue(request(&["openclaw", "status"]));
        let rejected = store.reject(&command.id, "target decommissioned").expect("reject");
        assert_eq!(rejected.state, CommandState::Rejected);
        assert_eq!(rejected.rejected_reason.as_deref(), Some("target decommissioned"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = {
            let store = CommandStore::new(dir.path());
            store.enqueue(request(&["openclaw", "status"])).id
        };
        let reopened = CommandStore::new(dir.path());
        let command = reopened.get(&id).expect("reloaded");
        assert_eq!(command.state, CommandState::Queued);
        // FIFO order survives the reload.
        assert_eq!(reopened.poll("m-1", None).expect("leased").id, id);
    }
}
