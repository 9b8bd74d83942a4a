use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AlarmError;

// ── Monitoring records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeGroup {
    pub uuid: String,
    pub name: String,
    pub owner_account: String,
    pub enabled: bool,
    #[serde(default)]
    pub contacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub probe_type: String,
    /// Opaque check configuration; equality participates in probe matching.
    pub config: Value,
    /// Inventory identifier of the agent running the check: an instance or a
    /// compute node.
    pub agent: String,
    /// Subject of the check, when distinct from the agent.
    #[serde(default)]
    pub machine: Option<String>,
    pub group_id: String,
    /// Whether the probe's events roll up into its group.
    pub group_events: bool,
    #[serde(default)]
    pub contacts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProbeGroup {
    pub name: String,
    pub contacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProbe {
    pub name: String,
    #[serde(rename = "type")]
    pub probe_type: String,
    pub config: Value,
    pub agent: String,
    #[serde(default)]
    pub machine: Option<String>,
    /// Resolved through the name → id index at apply time for groups that do
    /// not exist yet.
    pub group_id: String,
}

// ── Alarms ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub probe: String,
    pub event_class: String,
    pub time: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub machine: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: u64,
    #[serde(default)]
    pub probe_group: Option<String>,
    pub closed: bool,
    /// True when per-alarm notifications are suppressed.
    pub suppressed: bool,
    pub time_opened: DateTime<Utc>,
    #[serde(default)]
    pub time_closed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub faults: Vec<Fault>,
}

// ── Maintenance windows ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintScope {
    All,
    Probes(Vec<String>),
    ProbeGroups(Vec<String>),
    Machines(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintWindow {
    pub id: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub notes: String,
    pub scope: MaintScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMaintWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub notes: String,
    pub scope: MaintScope,
}

// ── Monitoring trait ─────────────────────────────────────────────────────────

/// The monitoring upstream: probe groups and probes per account, alarms, and
/// maintenance windows.
#[async_trait]
pub trait MonitoringApi: Send + Sync + 'static {
    async fn list_probe_groups(&self, account: &str) -> Result<Vec<ProbeGroup>, AlarmError>;

    /// Probes deployed on one agent. The reconciler fans this out over every
    /// known agent, including agents of destroyed VMs.
    async fn list_probes(&self, account: &str, agent: &str) -> Result<Vec<Probe>, AlarmError>;

    async fn create_probe_group(
        &self,
        account: &str,
        group: &NewProbeGroup,
    ) -> Result<ProbeGroup, AlarmError>;

    async fn delete_probe_group(&self, account: &str, uuid: &str) -> Result<(), AlarmError>;

    async fn create_probe(&self, account: &str, probe: &NewProbe) -> Result<Probe, AlarmError>;

    async fn delete_probe(&self, account: &str, uuid: &str) -> Result<(), AlarmError>;

    async fn list_alarms(&self, account: &str, open_only: bool) -> Result<Vec<Alarm>, AlarmError>;

    async fn get_alarm(&self, account: &str, id: u64) -> Result<Option<Alarm>, AlarmError>;

    async fn close_alarm(&self, account: &str, id: u64) -> Result<(), AlarmError>;

    async fn set_alarm_notification(
        &self,
        account: &str,
        id: u64,
        enabled: bool,
    ) -> Result<(), AlarmError>;

    async fn list_maintenance_windows(&self, account: &str)
        -> Result<Vec<MaintWindow>, AlarmError>;

    async fn create_maintenance_window(
        &self,
        account: &str,
        window: &NewMaintWindow,
    ) -> Result<MaintWindow, AlarmError>;

    async fn delete_maintenance_window(&self, account: &str, id: u64) -> Result<(), AlarmError>;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpMonitorConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

/// HTTP implementation of [`MonitoringApi`].
#[derive(Debug, Clone)]
pub struct HttpMonitor {
    config: HttpMonitorConfig,
    client: reqwest::Client,
}

impl HttpMonitor {
    pub fn new(config: HttpMonitorConfig) -> Result<Self, AlarmError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, account: &str, tail: &str) -> String {
        format!("{}/pub/{}/{}", self.config.base_url, account, tail)
    }
}

#[async_trait]
impl MonitoringApi for HttpMonitor {
    async fn list_probe_groups(&self, account: &str) -> Result<Vec<ProbeGroup>, AlarmError> {
        let url = self.url(account, "probegroups");
        debug!(%url, "listing probe groups");
        Ok(self.client.get(&url).send().await?.error_for_status()?.json().await?)
    }

    async fn list_probes(&self, account: &str, agent: &str) -> Result<Vec<Probe>, AlarmError> {
        let url = self.url(account, "probes");
        Ok(self
            .client
            .get(&url)
            .query(&[("agent", agent)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn create_probe_group(
        &self,
        account: &str,
        group: &NewProbeGroup,
    ) -> Result<ProbeGroup, AlarmError> {
        let url = self.url(account, "probegroups");
        Ok(self
            .client
            .post(&url)
            .json(group)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn delete_probe_group(&self, account: &str, uuid: &str) -> Result<(), AlarmError> {
        let url = self.url(account, &format!("probegroups/{}", uuid));
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn create_probe(&self, account: &str, probe: &NewProbe) -> Result<Probe, AlarmError> {
        let url = self.url(account, "probes");
        Ok(self
            .client
            .post(&url)
            .json(probe)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn delete_probe(&self, account: &str, uuid: &str) -> Result<(), AlarmError> {
        let url = self.url(account, &format!("probes/{}", uuid));
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn list_alarms(&self, account: &str, open_only: bool) -> Result<Vec<Alarm>, AlarmError> {
        let url = self.url(account, "alarms");
        let state = if open_only { "open" } else { "all" };
        Ok(self
            .client
            .get(&url)
            .query(&[("state", state)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn get_alarm(&self, account: &str, id: u64) -> Result<Option<Alarm>, AlarmError> {
        let url = self.url(account, &format!("alarms/{}", id));
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn close_alarm(&self, account: &str, id: u64) -> Result<(), AlarmError> {
        let url = self.url(account, &format!("alarms/{}", id));
        self.client
            .post(&url)
            .query(&[("action", "close")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn set_alarm_notification(
        &self,
        account: &str,
        id: u64,
        enabled: bool,
    ) -> Result<(), AlarmError> {
        let url = self.url(account, &format!("alarms/{}", id));
        let action = if enabled { "unsuppress" } else { "suppress" };
        self.client
            .post(&url)
            .query(&[("action", action)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_maintenance_windows(
        &self,
        account: &str,
    ) -> Result<Vec<MaintWindow>, AlarmError> {
        let url = self.url(account, "maintenances");
        Ok(self.client.get(&url).send().await?.error_for_status()?.json().await?)
    }

    async fn create_maintenance_window(
        &self,
        account: &str,
        window: &NewMaintWindow,
    ) -> Result<MaintWindow, AlarmError> {
        let url = self.url(account, "maintenances");
        Ok(self
            .client
            .post(&url)
            .json(window)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn delete_maintenance_window(&self, account: &str, id: u64) -> Result<(), AlarmError> {
        let url = self.url(account, &format!("maintenances/{}", id));
        self.client.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

// ── In-memory monitor ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MonitorState {
    groups: Vec<ProbeGroup>,
    probes: Vec<Probe>,
    alarms: HashMap<u64, Alarm>,
    windows: HashMap<u64, MaintWindow>,
    next_id: u64,
}

/// In-memory implementation of [`MonitoringApi`] for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a deployed probe group, returning its assigned uuid.
    pub async fn seed_group(&self, name: &str, contacts: &[&str]) -> String {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let uuid = format!("pg-{}", state.next_id);
        state.groups.push(ProbeGroup {
            uuid: uuid.clone(),
            name: name.to_string(),
            owner_account: "acct-operator".to_string(),
            enabled: true,
            contacts: contacts.iter().map(|c| c.to_string()).collect(),
        });
        uuid
    }

    /// Seed a deployed probe under an existing group.
    pub async fn seed_probe(
        &self,
        group_id: &str,
        name: &str,
        probe_type: &str,
        config: Value,
        agent: &str,
        machine: Option<&str>,
    ) -> String {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let uuid = format!("pr-{}", state.next_id);
        state.probes.push(Probe {
            uuid: uuid.clone(),
            name: name.to_string(),
            probe_type: probe_type.to_string(),
            config,
            agent: agent.to_string(),
            machine: machine.map(|m| m.to_string()),
            group_id: group_id.to_string(),
            group_events: true,
            contacts: None,
        });
        uuid
    }

    pub async fn seed_alarm(&self, alarm: Alarm) {
        self.state.write().await.alarms.insert(alarm.id, alarm);
    }

    pub async fn groups(&self) -> Vec<ProbeGroup> {
        self.state.read().await.groups.clone()
    }

    pub async fn probes(&self) -> Vec<Probe> {
        self.state.read().await.probes.clone()
    }
}

#[async_trait]
impl MonitoringApi for MemoryMonitor {
    async fn list_probe_groups(&self, _account: &str) -> Result<Vec<ProbeGroup>, AlarmError> {
        Ok(self.state.read().await.groups.clone())
    }

    async fn list_probes(&self, _account: &str, agent: &str) -> Result<Vec<Probe>, AlarmError> {
        Ok(self
            .state
            .read()
            .await
            .probes
            .iter()
            .filter(|p| p.agent == agent)
            .cloned()
            .collect())
    }

    async fn create_probe_group(
        &self,
        account: &str,
        group: &NewProbeGroup,
    ) -> Result<ProbeGroup, AlarmError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let created = ProbeGroup {
            uuid: format!("pg-{}", state.next_id),
            name: group.name.clone(),
            owner_account: account.to_string(),
            enabled: true,
            contacts: group.contacts.clone(),
        };
        state.groups.push(created.clone());
        Ok(created)
    }

    async fn delete_probe_group(&self, _account: &str, uuid: &str) -> Result<(), AlarmError> {
        let mut state = self.state.write().await;
        state.groups.retain(|g| g.uuid != uuid);
        Ok(())
    }

    async fn create_probe(&self, _account: &str, probe: &NewProbe) -> Result<Probe, AlarmError> {
        let mut state = self.state.write().await;
        if !state.groups.iter().any(|g| g.uuid == probe.group_id) {
            return Err(AlarmError::Internal(format!(
                "probe {} references unknown group {}",
                probe.name, probe.group_id
            )));
        }
        state.next_id += 1;
        let created = Probe {
            uuid: format!("pr-{}", state.next_id),
            name: probe.name.clone(),
            probe_type: probe.probe_type.clone(),
            config: probe.config.clone(),
            agent: probe.agent.clone(),
            machine: probe.machine.clone(),
            group_id: probe.group_id.clone(),
            group_events: true,
            contacts: None,
        };
        state.probes.push(created.clone());
        Ok(created)
    }

    async fn delete_probe(&self, _account: &str, uuid: &str) -> Result<(), AlarmError> {
        let mut state = self.state.write().await;
        state.probes.retain(|p| p.uuid != uuid);
        Ok(())
    }

    async fn list_alarms(&self, _account: &str, open_only: bool) -> Result<Vec<Alarm>, AlarmError> {
        let state = self.state.read().await;
        let mut alarms: Vec<Alarm> = state
            .alarms
            .values()
            .filter(|a| !open_only || !a.closed)
            .cloned()
            .collect();
        alarms.sort_by_key(|a| a.id);
        Ok(alarms)
    }

    async fn get_alarm(&self, _account: &str, id: u64) -> Result<Option<Alarm>, AlarmError> {
        Ok(self.state.read().await.alarms.get(&id).cloned())
    }

    async fn close_alarm(&self, _account: &str, id: u64) -> Result<(), AlarmError> {
        let mut state = self.state.write().await;
        match state.alarms.get_mut(&id) {
            Some(alarm) => {
                alarm.closed = true;
                alarm.time_closed = Some(Utc::now());
                Ok(())
            }
            None => Err(AlarmError::NotFound(id)),
        }
    }

    async fn set_alarm_notification(
        &self,
        _account: &str,
        id: u64,
        enabled: bool,
    ) -> Result<(), AlarmError> {
        let mut state = self.state.write().await;
        match state.alarms.get_mut(&id) {
            Some(alarm) => {
                alarm.suppressed = !enabled;
                Ok(())
            }
            None => Err(AlarmError::NotFound(id)),
        }
    }

    async fn list_maintenance_windows(
        &self,
        _account: &str,
    ) -> Result<Vec<MaintWindow>, AlarmError> {
        let state = self.state.read().await;
        let mut windows: Vec<MaintWindow> = state.windows.values().cloned().collect();
        windows.sort_by_key(|w| w.id);
        Ok(windows)
    }

    async fn create_maintenance_window(
        &self,
        _account: &str,
        window: &NewMaintWindow,
    ) -> Result<MaintWindow, AlarmError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let created = MaintWindow {
            id: state.next_id,
            start: window.start,
            end: window.end,
            notes: window.notes.clone(),
            scope: window.scope.clone(),
        };
        state.windows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_maintenance_window(&self, _account: &str, id: u64) -> Result<(), AlarmError> {
        let mut state = self.state.write().await;
        match state.windows.remove(&id) {
            Some(_) => Ok(()),
            None => Err(AlarmError::NotFound(id)),
        }
    }
}
