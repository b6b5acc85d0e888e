//! Operator-facing SSH connection list, persisted to
//! `ssh-connections.json` (0600) in the settings dir.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_persist::write_atomic_private;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnection {
    pub id: String,
    pub label: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSshConnection {
    pub label: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
}

fn default_ssh_port() -> u16 {
    22
}

pub struct SshConnectionStore {
    path: PathBuf,
    connections: Mutex<Vec<SshConnection>>,
}

impl SshConnectionStore {
    pub fn new(settings_dir: &Path) -> Self {
        let path = settings_dir.join("ssh-connections.json");
        let connections = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt ssh-connections.json, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            connections: Mutex::new(connections),
        }
    }

    /// Add a connection. The key path is confined to `~/.ssh` up front so
    /// a bad entry can never be saved.
    pub fn add(&self, new: NewSshConnection) -> Result<SshConnection, patze_tunnel::TunnelError> {
        patze_tunnel::resolve_private_key(&new.private_key_path)?;
        let connection = SshConnection {
            id: patze_proto::prefixed_id("sshc"),
            label: new.label,
            host: new.host,
            port: new.port,
            user: new.user,
            private_key_path: new.private_key_path,
            created_at: Utc::now(),
        };
        let mut connections = self.connections.lock();
        connections.push(connection.clone());
        self.persist(&connections);
        Ok(connection)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| c.id != id);
        let removed = connections.len() != before;
        if removed {
            self.persist(&connections);
        }
        removed
    }

    pub fn list(&self) -> Vec<SshConnection> {
        self.connections.lock().clone()
    }

    fn persist(&self, connections: &[SshConnection]) {
        match serde_json::to_vec_pretty(connections) {
            Ok(bytes) => {
                if let Err(e) = write_atomic_private(&self.path, &bytes) {
                    warn!(error = %e, "failed to persist ssh connections");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize ssh connections"),
        }
    }
}
