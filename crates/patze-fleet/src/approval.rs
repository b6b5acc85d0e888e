//! Batched policy application with critical-change approval tokens.
//!
//! A batch that would push more than K targets into critical risk requires
//! an approval token. Tokens are single-use, bound to a signature over the
//! batch contents, and expire after a short TTL, so the approved request is
//! exactly the one that runs.

use crate::policy::{PolicyError, PolicyStore};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use patze_proto::{FleetTargetStatus, RiskLevel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval token not found")]
    NotFound,
    #[error("approval token expired")]
    Expired,
    #[error("approval token does not match this request")]
    SignatureMismatch,
    #[error("batch contains no items")]
    EmptyBatch,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchApplyItem {
    pub target_id: String,
    pub policy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchApplyRequest {
    pub items: Vec<BatchApplyItem>,
    #[serde(default)]
    pub reconcile_after_apply: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub applied: usize,
    pub reconcile_after_apply: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum BatchOutcome {
    Applied { summary: BatchSummary },
    ApprovalRequired { token: String, expires_at: DateTime<Utc> },
}

/// Signature over the batch: sorted `(targetId, policyId)` pairs plus the
/// reconcile flag.
pub fn batch_signature(items: &[BatchApplyItem], reconcile_after_apply: bool) -> String {
    let mut pairs: Vec<String> = items
        .iter()
        .map(|item| format!("{}\u{1f}{}", item.target_id, item.policy_id))
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(if reconcile_after_apply { b"1" } else { b"0" });
    hex::encode(hasher.finalize())
}

struct IssuedToken {
    signature: String,
    expires_at: DateTime<Utc>,
}

pub struct ApprovalStore {
    tokens: Mutex<HashMap<String, IssuedToken>>,
    ttl_ms: u64,
    critical_threshold: usize,
}

impl ApprovalStore {
    pub fn new(ttl_ms: u64, critical_threshold: usize) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl_ms,
            critical_threshold,
        }
    }

    pub fn critical_threshold(&self) -> usize {
        self.critical_threshold
    }

    pub fn issue(&self, signature: &str) -> (String, DateTime<Utc>) {
        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + Duration::milliseconds(self.ttl_ms as i64);
        self.tokens.lock().insert(
            token.clone(),
            IssuedToken {
                signature: signature.to_string(),
                expires_at,
            },
        );
        (token, expires_at)
    }

    /// Consume a token: single-use, signature-bound, TTL-checked. A
    /// signature mismatch leaves the token intact for the request it was
    /// actually issued for.
    pub fn consume(&self, token: &str, signature: &str) -> Result<(), ApprovalError> {
        let mut tokens = self.tokens.lock();
        let Some(issued) = tokens.get(token) else {
            return Err(ApprovalError::NotFound);
        };
        if Utc::now() > issued.expires_at {
            tokens.remove(token);
            return Err(ApprovalError::Expired);
        }
        if issued.signature != signature {
            return Err(ApprovalError::SignatureMismatch);
        }
        tokens.remove(token);
        Ok(())
    }

    /// Drop expired tokens; called from the engine's housekeeping tick.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.tokens.lock().retain(|_, issued| issued.expires_at >= now);
    }
}

/// Apply a batch of policy assignments. `preview` evaluates what a target's
/// status would be under the new policy; it drives the critical-count gate.
pub fn batch_apply(
    request: &BatchApplyRequest,
    policies: &PolicyStore,
    approvals: &ApprovalStore,
    preview: impl Fn(&BatchApplyItem) -> Option<FleetTargetStatus>,
) -> Result<BatchOutcome, ApprovalError> {
    if request.items.is_empty() {
        return Err(ApprovalError::EmptyBatch);
    }
    for item in &request.items {
        if policies.get_profile(&item.policy_id).is_none() {
            return Err(PolicyError::NotFound(item.policy_id.clone()).into());
        }
    }

    let signature = batch_signature(&request.items, request.reconcile_after_apply);

    match &request.approval_token {
        Some(token) => approvals.consume(token, &signature)?,
        None => {
            let critical = request
                .items
                .iter()
                .filter_map(&preview)
                .filter(|status| status.risk_level == RiskLevel::Critical)
                .count();
            if critical > approvals.critical_threshold() {
                let (token, expires_at) = approvals.issue(&signature);
                info!(critical, threshold = approvals.critical_threshold(), "batch apply held for approval");
                return Ok(BatchOutcome::ApprovalRequired { token, expires_at });
            }
        }
    }

    for item in &request.items {
        policies.assign(&item.target_id, &item.policy_id)?;
    }
    info!(applied = request.items.len(), "batch policy apply committed");
    Ok(BatchOutcome::Applied {
        summary: BatchSummary {
            applied: request.items.len(),
            reconcile_after_apply: request.reconcile_after_apply,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DEFAULT_PROFILE_ID, PolicyStore};
    use patze_proto::{DesiredState, ReportedState};

    fn status(target_id: &str, score: u8) -> FleetTargetStatus {
        FleetTargetStatus {
            target_id: target_id.to_string(),
            policy_profile_id: DEFAULT_PROFILE_ID.to_string(),
            desired: DesiredState {
                bridge_version: None,
                config_hash: "h".to_string(),
                max_sync_lag_ms: 300_000,
                allow_auto_remediation: false,
            },
            reported: ReportedState::default(),
            drifts: vec![],
            violations: vec![],
            health_score: score,
            risk_level: RiskLevel::from_score(score),
            updated_at: Utc::now(),
        }
    }

    fn items(n: usize) -> Vec<BatchApplyItem> {
        (0..n)
            .map(|i| BatchApplyItem {
                target_id: format!("t-{i}"),
                policy_id: DEFAULT_PROFILE_ID.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_signature_order_independent() {
        let mut a = items(3);
        let b = a.clone();
        a.reverse();
        assert_eq!(batch_signature(&a, true), batch_signature(&b, true));
        assert_ne!(batch_signature(&a, true), batch_signature(&a, false));
    }

    #[test]
    fn test_under_threshold_applies_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policies = PolicyStore::new(dir.path());
        let approvals = ApprovalStore::new(300_000, 3);

        let request = BatchApplyRequest {
            items: items(5),
            reconcile_after_apply: true,
            approval_token: None,
        };
        // Only two would be critical: below the threshold of three.
        let outcome = batch_apply(&request, &policies, &approvals, |item| {
            let critical = item.target_id == "t-0" || item.target_id == "t-1";
            Some(status(&item.target_id, if critical { 10 } else { 95 }))
        })
        .expect("apply");

        match outcome {
            BatchOutcome::Applied { summary } => {
                assert_eq!(summary.applied, 5);
                assert!(summary.reconcile_after_apply);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_gate_and_token_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policies = PolicyStore::new(dir.path());
        let approvals = ApprovalStore::new(300_000, 3);

        let mut request = BatchApplyRequest {
            items: items(5),
            reconcile_after_apply: false,
            approval_token: None,
        };
        // Four of five would become critical: over the threshold.
        let preview = |item: &BatchApplyItem| {
            let score = if item.target_id == "t-4" { 95 } else { 10 };
            Some(status(&item.target_id, score))
        };

        let token = match batch_apply(&request, &policies, &approvals, preview).expect("gate") {
            BatchOutcome::ApprovalRequired { token, .. } => token,
            other => panic!("expected ApprovalRequired, got {other:?}"),
        };

        // Resubmit with the token: applies.
        request.approval_token = Some(token.clone());
        match batch_apply(&request, &policies, &approvals, preview).expect("apply") {
            BatchOutcome::Applied { summary } => assert_eq!(summary.applied, 5),
            other => panic!("expected Applied, got {other:?}"),
        }

        // Token is single-use.
        let err = batch_apply(&request, &policies, &approvals, preview).expect_err("reuse");
        assert_eq!(err, ApprovalError::NotFound);
    }

    #[test]
    fn test_token_bound_to_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policies = PolicyStore::new(dir.path());
        let approvals = ApprovalStore::new(300_000, 0);

        let request = BatchApplyRequest {
            items: items(2),
            reconcile_after_apply: false,
            approval_token: None,
        };
        let token = match batch_apply(&request, &policies, &approvals, |item| {
            Some(status(&item.target_id, 10))
        })
        .expect("gate")
        {
            BatchOutcome::ApprovalRequired { token, .. } => token,
            other => panic!("expected ApprovalRequired, got {other:?}"),
        };

        // Different batch contents with the same token: rejected, token kept.
        let tampered = BatchApplyRequest {
            items: items(3),
            reconcile_after_apply: false,
            approval_token: Some(token.clone()),
        };
        let err = batch_apply(&tampered, &policies, &approvals, |_| None).expect_err("tampered");
        assert_eq!(err, ApprovalError::SignatureMismatch);

        // The original request still works.
        let original = BatchApplyRequest {
            approval_token: Some(token),
            ..request
        };
        assert!(matches!(
            batch_apply(&original, &policies, &approvals, |_| None).expect("apply"),
            BatchOutcome::Applied { .. }
        ));
    }

    #[test]
    fn test_expired_token() {
        let approvals = ApprovalStore::new(0, 0);
        let (token, _) = approvals.issue("sig");
        // TTL of zero: immediately expired.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(approvals.consume(&token, "sig"), Err(ApprovalError::Expired));
        // And consumed by the expiry.
        assert_eq!(approvals.consume(&token, "sig"), Err(ApprovalError::NotFound));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policies = PolicyStore::new(dir.path());
        let approvals = ApprovalStore::new(300_000, 3);

        let request = BatchApplyRequest {
            items: vec![BatchApplyItem {
                target_id: "t-1".to_string(),
                policy_id: "pol-ghost".to_string(),
            }],
            reconcile_after_apply: false,
            approval_token: None,
        };
        assert!(matches!(
            batch_apply(&request, &policies, &approvals, |_| None),
            Err(ApprovalError::Policy(PolicyError::NotFound(_)))
        ));
    }
}
