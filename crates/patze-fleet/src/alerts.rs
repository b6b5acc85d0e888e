//! Alert routing with per-destination cooldowns.
//!
//! Destinations declare a minimum severity; rules narrow which destinations
//! see which targets. With no rules configured, every destination matches.
//! Delivery is best-effort: webhook failures are logged, never retried here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patze_persist::write_atomic;
use patze_proto::{FleetTargetStatus, ViolationSeverity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AlertDestinationKind {
    Webhook { url: String },
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDestination {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: AlertDestinationKind,
    pub minimum_severity: AlertSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum AlertRuleScope {
    All,
    TargetIds { target_ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub minimum_severity: AlertSeverity,
    #[serde(flatten)]
    pub scope: AlertRuleScope,
    pub destination_ids: Vec<String>,
}

/// One alert emitted by the fleet engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAlert {
    pub kind: String,
    pub target_id: String,
    pub severity: AlertSeverity,
    pub summary: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub destination_id: String,
    pub delivered: bool,
    pub suppressed_by_cooldown: bool,
}

/// On-disk shape of `fleet-alerts.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertsFile {
    destinations: Vec<AlertDestination>,
    rules: Vec<AlertRule>,
}

type CooldownKey = (String, String, String, String);

pub struct AlertRouter {
    path: PathBuf,
    config: Mutex<AlertsFile>,
    cooldowns: Mutex<HashMap<CooldownKey, DateTime<Utc>>>,
    cooldown_ms: u64,
    client: reqwest::Client,
}

impl AlertRouter {
    /// Load destinations and rules from `fleet-alerts.json`.
    pub fn new(settings_dir: &Path, cooldown_ms: u64) -> Self {
        let path = settings_dir.join("fleet-alerts.json");
        let config = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt fleet-alerts.json, starting empty");
                AlertsFile::default()
            }),
            Err(_) => AlertsFile::default(),
        };
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            path,
            config: Mutex::new(config),
            cooldowns: Mutex::new(HashMap::new()),
            cooldown_ms,
            client,
        }
    }

    pub fn list_destinations(&self) -> Vec<AlertDestination> {
        self.config.lock().destinations.clone()
    }

    pub fn list_rules(&self) -> Vec<AlertRule> {
        self.config.lock().rules.clone()
    }

    pub fn upsert_destination(&self, destination: AlertDestination) {
        let mut config = self.config.lock();
        config.destinations.retain(|d| d.id != destination.id);
        config.destinations.push(destination);
        self.persist(&config);
    }

    pub fn remove_destination(&self, id: &str) {
        let mut config = self.config.lock();
        config.destinations.retain(|d| d.id != id);
        for rule in &mut config.rules {
            rule.destination_ids.retain(|d| d != id);
        }
        self.persist(&config);
    }

    pub fn upsert_rule(&self, rule: AlertRule) {
        let mut config = self.config.lock();
        config.rules.retain(|r| r.id != rule.id);
        config.rules.push(rule);
        self.persist(&config);
    }

    pub fn remove_rule(&self, id: &str) {
        let mut config = self.config.lock();
        config.rules.retain(|r| r.id != id);
        self.persist(&config);
    }

    /// Destinations an alert should go to, before cooldown.
    fn select_destinations(&self, alert: &FleetAlert) -> Vec<AlertDestination> {
        let config = self.config.lock();

        let rule_selected: Option<Vec<String>> = if config.rules.is_empty() {
            None
        } else {
            let mut ids: Vec<String> = config
                .rules
                .iter()
                .filter(|rule| alert.severity >= rule.minimum_severity)
                .filter(|rule| match &rule.scope {
                    AlertRuleScope::All => true,
                    AlertRuleScope::TargetIds { target_ids } => {
                        target_ids.contains(&alert.target_id)
                    }
                })
                .flat_map(|rule| rule.destination_ids.iter().cloned())
                .collect();
            ids.sort();
            ids.dedup();
            Some(ids)
        };

        config
            .destinations
            .iter()
            .filter(|dest| alert.severity >= dest.minimum_severity)
            .filter(|dest| {
                rule_selected
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&dest.id))
            })
            .cloned()
            .collect()
    }

    /// Route one alert. Repeats of the same `(destination, kind, target,
    /// summary)` within the cooldown window are suppressed.
    pub async fn route(&self, alert: &FleetAlert) -> Vec<DeliveryOutcome> {
        let destinations = self.select_destinations(alert);
        let now = Utc::now();
        let mut outcomes = Vec::new();

        for destination in destinations {
            let key: CooldownKey = (
                destination.id.clone(),
                alert.kind.clone(),
                alert.target_id.clone(),
                alert.summary.clone(),
            );
            let suppressed = {
                let mut cooldowns = self.cooldowns.lock();
                match cooldowns.get(&key) {
                    Some(last)
                        if now.signed_duration_since(*last).num_milliseconds()
                            < self.cooldown_ms as i64 =>
                    {
                        true
                    }
                    _ => {
                        cooldowns.insert(key, now);
                        false
                    }
                }
            };

            if suppressed {
                outcomes.push(DeliveryOutcome {
                    destination_id: destination.id,
                    delivered: false,
                    suppressed_by_cooldown: true,
                });
                continue;
            }

            let delivered = self.deliver(&destination, alert).await;
            outcomes.push(DeliveryOutcome {
                destination_id: destination.id,
                delivered,
                suppressed_by_cooldown: false,
            });
        }
        outcomes
    }

    async fn deliver(&self, destination: &AlertDestination, alert: &FleetAlert) -> bool {
        match &destination.kind {
            AlertDestinationKind::Log => {
                info!(
                    destination = %destination.name,
                    kind = %alert.kind,
                    target_id = %alert.target_id,
                    severity = ?alert.severity,
                    summary = %alert.summary,
                    "fleet alert"
                );
                true
            }
            AlertDestinationKind::Webhook { url } => {
                match self.client.post(url).json(alert).send().await {
                    Ok(response) if response.status().is_success() => true,
                    Ok(response) => {
                        warn!(
                            destination = %destination.name,
                            status = %response.status(),
                            "alert webhook returned non-success"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(destination = %destination.name, error = %e, "alert webhook failed");
                        false
                    }
                }
            }
        }
    }

    fn persist(&self, config: &AlertsFile) {
        match serde_json::to_vec_pretty(config) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path, &bytes) {
                    warn!(error = %e, "failed to persist fleet-alerts.json");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize fleet alerts"),
        }
    }
}

/// Turn a target status into alerts, one per violation at `high`+ and one
/// summary alert when the target is critical.
pub fn alerts_from_status(status: &FleetTargetStatus) -> Vec<FleetAlert> {
    let mut alerts = Vec::new();

    for violation in &status.violations {
        let severity = match violation.severity {
            ViolationSeverity::Warn => AlertSeverity::Warning,
            ViolationSeverity::High | ViolationSeverity::Critical => AlertSeverity::Critical,
        };
        alerts.push(FleetAlert {
            kind: violation.code.clone(),
            target_id: status.target_id.clone(),
            severity,
            summary: violation.message.clone(),
            details: serde_json::json!({
                "healthScore": status.health_score,
                "riskLevel": status.risk_level,
            }),
        });
    }

    if status.risk_level == patze_proto::RiskLevel::Critical {
        alerts.push(FleetAlert {
            kind: "target_critical".to_string(),
            target_id: status.target_id.clone(),
            severity: AlertSeverity::Critical,
            summary: format!("target health score {} is critical", status.health_score),
            details: serde_json::json!({
                "healthScore": status.health_score,
                "drifts": status.drifts.len(),
                "violations": status.violations.len(),
            }),
        });
    }

    alerts
}
