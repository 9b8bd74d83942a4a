use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shoal_domain::ComputeId;
use tokio::sync::RwLock;

use crate::api::{
    Application, ComputeNodeRecord, ImageRecord, InstanceRecord, InventoryApi, ServiceRecord,
    VmRecord,
};
use crate::error::InventoryError;
use crate::snapshot::MEMBERSHIP_TAG;

#[derive(Debug, Default)]
struct Inner {
    applications: Vec<Application>,
    services: Vec<ServiceRecord>,
    instances: Vec<InstanceRecord>,
    active_vms: Vec<VmRecord>,
    destroyed_vms: Vec<VmRecord>,
    compute_nodes: Vec<ComputeNodeRecord>,
    /// Keyed by the service-name tag the image was published under.
    images: HashMap<String, Vec<ImageRecord>>,
}

/// In-memory implementation of [`InventoryApi`].
///
/// Backs tests and offline rehearsals; build one with [`MemoryInventory::builder`].
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryInventory {
    pub fn builder() -> MemoryInventoryBuilder {
        MemoryInventoryBuilder::default()
    }
}

#[async_trait]
impl InventoryApi for MemoryInventory {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.applications.iter().find(|a| a.name == name).cloned())
    }

    async fn list_services(&self, app_uuid: &str) -> Result<Vec<ServiceRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard
            .services
            .iter()
            .filter(|s| s.application_uuid == app_uuid)
            .cloned()
            .collect())
    }

    async fn list_instances(&self, _app_uuid: &str) -> Result<Vec<InstanceRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.instances.clone())
    }

    async fn list_active_vms(&self, _owner: &str) -> Result<Vec<VmRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.active_vms.clone())
    }

    async fn list_destroyed_vms(&self, _owner: &str) -> Result<Vec<VmRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.destroyed_vms.clone())
    }

    async fn get_compute_node(
        &self,
        compute_id: &ComputeId,
    ) -> Result<Option<ComputeNodeRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard
            .compute_nodes
            .iter()
            .find(|cn| cn.uuid == compute_id.as_str())
            .cloned())
    }

    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNodeRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.compute_nodes.clone())
    }

    async fn list_images(&self, service: &str) -> Result<Vec<ImageRecord>, InventoryError> {
        let guard = self.inner.read().await;
        Ok(guard.images.get(service).cloned().unwrap_or_default())
    }

    async fn update_app_metadata(
        &self,
        app_uuid: &str,
        key: &str,
        value: Value,
    ) -> Result<(), InventoryError> {
        let mut guard = self.inner.write().await;
        let app = guard
            .applications
            .iter_mut()
            .find(|a| a.uuid == app_uuid)
            .ok_or_else(|| InventoryError::ApplicationNotFound(app_uuid.to_string()))?;
        app.metadata.insert(key.to_string(), value);
        Ok(())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryInventoryBuilder {
    inner: Inner,
    next_ip: u8,
}

impl Default for MemoryInventoryBuilder {
    fn default() -> Self {
        let app = Application {
            uuid: "app-shoal".to_string(),
            name: "shoal".to_string(),
            owner_account: "acct-operator".to_string(),
            metadata: HashMap::new(),
        };
        Self {
            inner: Inner {
                applications: vec![app],
                ..Default::default()
            },
            next_ip: 1,
        }
    }
}

impl MemoryInventoryBuilder {
    pub fn app_metadata(mut self, key: &str, value: Value) -> Self {
        self.inner.applications[0].metadata.insert(key.to_string(), value);
        self
    }

    pub fn service(mut self, name: &str) -> Self {
        self.inner.services.push(ServiceRecord {
            uuid: format!("svc-{}", name),
            name: name.to_string(),
            application_uuid: "app-shoal".to_string(),
        });
        self
    }

    /// A local instance: registry record plus an active VM on `compute`,
    /// with an auto-assigned primary address.
    pub fn instance(
        self,
        uuid: &str,
        service: &str,
        compute: &str,
        image: &str,
        metadata: &[(&str, &str)],
    ) -> Self {
        let ip = format!("10.0.0.{}", self.next_ip);
        self.instance_addr(uuid, service, compute, image, &ip, metadata)
    }

    /// A local instance with an explicit primary address.
    pub fn instance_addr(
        mut self,
        uuid: &str,
        service: &str,
        compute: &str,
        image: &str,
        address: &str,
        metadata: &[(&str, &str)],
    ) -> Self {
        self.next_ip = self.next_ip.wrapping_add(1);
        self.inner.instances.push(InstanceRecord {
            uuid: uuid.to_string(),
            service_uuid: format!("svc-{}", service),
            metadata: to_map(metadata),
        });
        self.inner.active_vms.push(VmRecord {
            uuid: uuid.to_string(),
            alias: Some(format!("{}.{}", service, uuid)),
            state: "running".to_string(),
            server_uuid: Some(compute.to_string()),
            image_uuid: image.to_string(),
            primary_ip: Some(address.to_string()),
            tags: HashMap::from([(MEMBERSHIP_TAG.to_string(), service.to_string())]),
            metadata: HashMap::new(),
        });
        self
    }

    /// A registry-only instance with no VM record: lives in another
    /// datacenter as far as the local inventory is concerned.
    pub fn remote_instance(
        mut self,
        uuid: &str,
        service: &str,
        metadata: &[(&str, &str)],
    ) -> Self {
        self.inner.instances.push(InstanceRecord {
            uuid: uuid.to_string(),
            service_uuid: format!("svc-{}", service),
            metadata: to_map(metadata),
        });
        self
    }

    pub fn destroyed_vm(mut self, uuid: &str, service: &str) -> Self {
        self.inner.destroyed_vms.push(VmRecord {
            uuid: uuid.to_string(),
            alias: None,
            state: "destroyed".to_string(),
            server_uuid: None,
            image_uuid: String::new(),
            primary_ip: None,
            tags: HashMap::from([(MEMBERSHIP_TAG.to_string(), service.to_string())]),
            metadata: HashMap::new(),
        });
        self
    }

    pub fn compute_node(mut self, uuid: &str, hostname: &str, headnode: bool) -> Self {
        let n = self.inner.compute_nodes.len() + 1;
        self.inner.compute_nodes.push(ComputeNodeRecord {
            uuid: uuid.to_string(),
            hostname: hostname.to_string(),
            datacenter: "dc-east-1".to_string(),
            ram: 262_144,
            headnode,
            admin_ip: Some(format!("172.16.0.{}", n)),
        });
        self
    }

    pub fn image(mut self, uuid: &str, service: &str, version: &str) -> Self {
        self.inner
            .images
            .entry(service.to_string())
            .or_default()
            .push(ImageRecord {
                uuid: uuid.to_string(),
                name: format!("{}-image", service),
                version: version.to_string(),
            });
        self
    }

    pub fn build(self) -> MemoryInventory {
        MemoryInventory {
            inner: Arc::new(RwLock::new(self.inner)),
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
