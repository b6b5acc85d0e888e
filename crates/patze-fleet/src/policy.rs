//! Policy profile store and target assignments.

use chrono::Utc;
use parking_lot::Mutex;
use patze_persist::JsonStore;
use patze_proto::FleetPolicyProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_PROFILE_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy profile '{0}' not found")]
    NotFound(String),
    #[error("the default profile cannot be removed")]
    DefaultImmutable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPolicyProfile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bridge_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sync_lag_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_auth_mode: Option<patze_proto::AuthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,
}

struct Inner {
    profiles: HashMap<String, FleetPolicyProfile>,
    assignments: HashMap<String, String>,
}

/// Profiles plus the target→profile assignment map, snapshot-persisted.
/// A default profile always exists and is recreated if missing on load.
pub struct PolicyStore {
    inner: Mutex<Inner>,
    profiles_store: JsonStore,
    assignments_store: JsonStore,
}

impl PolicyStore {
    pub fn new(state_path: &Path) -> Self {
        let profiles_store = JsonStore::new(state_path, "fleet_policies");
        let assignments_store = JsonStore::new(state_path, "fleet_assignments");

        let mut profiles: HashMap<String, FleetPolicyProfile> = profiles_store.load();
        if !profiles.contains_key(DEFAULT_PROFILE_ID) {
            profiles.insert(
                DEFAULT_PROFILE_ID.to_string(),
                FleetPolicyProfile::default_profile(Utc::now()),
            );
        }
        let assignments: HashMap<String, String> = assignments_store.load();
        info!(profiles = profiles.len(), assignments = assignments.len(), "loaded fleet policies");

        let store = Self {
            inner: Mutex::new(Inner {
                profiles,
                assignments,
            }),
            profiles_store,
            assignments_store,
        };
        store.persist_profiles();
        store
    }

    pub fn create_profile(&self, new: NewPolicyProfile) -> FleetPolicyProfile {
        let now = Utc::now();
        let defaults = FleetPolicyProfile::default_profile(now);
        let profile = FleetPolicyProfile {
            id: patze_proto::prefixed_id("pol"),
            name: new.name,
            min_bridge_version: new.min_bridge_version,
            max_sync_lag_ms: new.max_sync_lag_ms.unwrap_or(defaults.max_sync_lag_ms),
            allowed_auth_mode: new.allowed_auth_mode.unwrap_or(defaults.allowed_auth_mode),
            max_consecutive_failures: new
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .profiles
            .insert(profile.id.clone(), profile.clone());
        self.persist_profiles();
        profile
    }

    pub fn get_profile(&self, id: &str) -> Option<FleetPolicyProfile> {
        self.inner.lock().profiles.get(id).cloned()
    }

    pub fn list_profiles(&self) -> Vec<FleetPolicyProfile> {
        let inner = self.inner.lock();
        let mut out: Vec<FleetPolicyProfile> = inner.profiles.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn remove_profile(&self, id: &str) -> Result<(), PolicyError> {
        if id == DEFAULT_PROFILE_ID {
            return Err(PolicyError::DefaultImmutable);
        }
        let mut inner = self.inner.lock();
        if inner.profiles.remove(id).is_none() {
            return Err(PolicyError::NotFound(id.to_string()));
        }
        // Targets assigned to the removed profile fall back to default.
        inner.assignments.retain(|_, profile_id| profile_id != id);
        drop(inner);
        self.persist_profiles();
        self.persist_assignments();
        Ok(())
    }

    pub fn assign(&self, target_id: &str, profile_id: &str) -> Result<(), PolicyError> {
        let mut inner = self.inner.lock();
        if !inner.profiles.contains_key(profile_id) {
            return Err(PolicyError::NotFound(profile_id.to_string()));
        }
        inner
            .assignments
            .insert(target_id.to_string(), profile_id.to_string());
        drop(inner);
        self.persist_assignments();
        Ok(())
    }

    /// The profile effective for a target: its assignment, or default.
    pub fn profile_for_target(&self, target_id: &str) -> FleetPolicyProfile {
        let inner = self.inner.lock();
        let profile_id = inner
            .assignments
            .get(target_id)
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROFILE_ID);
        inner
            .profiles
            .get(profile_id)
            .or_else(|| inner.profiles.get(DEFAULT_PROFILE_ID))
            .cloned()
            .unwrap_or_else(|| FleetPolicyProfile::default_profile(Utc::now()))
    }

    fn persist_profiles(&self) {
        let inner = self.inner.lock();
        if let Err(e) = self.profiles_store.save(&inner.profiles) {
            warn!(error = %e, "failed to persist fleet policies");
        }
    }

    fn persist_assignments(&self) {
        let inner = self.inner.lock();
        if let Err(e) = self.assignments_store.save(&inner.assignments) {
            warn!(error = %e, "failed to persist fleet assignments");
        }
    }
}
