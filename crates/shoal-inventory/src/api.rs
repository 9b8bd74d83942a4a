use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoal_domain::ComputeId;

use crate::error::InventoryError;

// ── Upstream record shapes ───────────────────────────────────────────────────

/// Application record from the service registry. The fleet application owns
/// every service and carries the coordination-store property in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub uuid: String,
    pub name: String,
    pub owner_account: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub uuid: String,
    pub name: String,
    pub application_uuid: String,
}

/// Registry view of an instance. Joined with the VM record by uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uuid: String,
    pub service_uuid: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// VM inventory record. `server_uuid` is absent for VMs the local inventory
/// does not know (another datacenter's instances).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub state: String,
    #[serde(default)]
    pub server_uuid: Option<String>,
    pub image_uuid: String,
    #[serde(default)]
    pub primary_ip: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Compute-node inventory record, with the admin-network address already
/// extracted from sysinfo by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNodeRecord {
    pub uuid: String,
    pub hostname: String,
    pub datacenter: String,
    pub ram: u64,
    #[serde(default)]
    pub headnode: bool,
    #[serde(default)]
    pub admin_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub uuid: String,
    pub name: String,
    pub version: String,
}

// ── Upstream trait ───────────────────────────────────────────────────────────

/// The union of upstream inventory APIs the toolkit consumes: the
/// application/service registry, the VM and compute-node inventories, and
/// the image registry. The registry application's metadata doubles as the
/// coordination store.
#[async_trait]
pub trait InventoryApi: Send + Sync + 'static {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, InventoryError>;

    async fn list_services(&self, app_uuid: &str) -> Result<Vec<ServiceRecord>, InventoryError>;

    async fn list_instances(&self, app_uuid: &str) -> Result<Vec<InstanceRecord>, InventoryError>;

    /// Active VMs owned by `owner`. The loader filters these to the fleet
    /// membership tag.
    async fn list_active_vms(&self, owner: &str) -> Result<Vec<VmRecord>, InventoryError>;

    /// Destroyed VMs owned by `owner`. Consumed by the alarm reconciler so
    /// probes on dead agents get cleaned up.
    async fn list_destroyed_vms(&self, owner: &str) -> Result<Vec<VmRecord>, InventoryError>;

    /// Ok(None) when the compute node is unknown to the local inventory.
    async fn get_compute_node(
        &self,
        compute_id: &ComputeId,
    ) -> Result<Option<ComputeNodeRecord>, InventoryError>;

    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNodeRecord>, InventoryError>;

    /// Images published under the given service-name tag.
    async fn list_images(&self, service: &str) -> Result<Vec<ImageRecord>, InventoryError>;

    /// Rewrite a single application-metadata property. The write replaces
    /// the property's whole value in one upstream call.
    async fn update_app_metadata(
        &self,
        app_uuid: &str,
        key: &str,
        value: Value,
    ) -> Result<(), InventoryError>;
}
