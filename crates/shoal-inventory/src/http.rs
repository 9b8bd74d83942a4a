use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use shoal_domain::ComputeId;
use tracing::debug;

use crate::api::{
    Application, ComputeNodeRecord, ImageRecord, InstanceRecord, InventoryApi, ServiceRecord,
    VmRecord,
};
use crate::error::InventoryError;

/// Base URLs of the upstream inventory services.
#[derive(Debug, Clone)]
pub struct HttpInventoryConfig {
    /// Application/service registry.
    pub registry_url: String,
    /// VM inventory.
    pub vms_url: String,
    /// Compute-node inventory.
    pub cn_url: String,
    /// Image registry.
    pub images_url: String,
    pub request_timeout: Duration,
}

/// HTTP implementation of [`InventoryApi`]. Thin: every method is one GET or
/// PUT with typed request/response records; joining lives in the loader.
#[derive(Debug, Clone)]
pub struct HttpInventory {
    config: HttpInventoryConfig,
    client: reqwest::Client,
}

/// Wire shape of a compute-node record: the admin address is nested in
/// sysinfo upstream and flattened here.
#[derive(Debug, Deserialize)]
struct WireComputeNode {
    uuid: String,
    hostname: String,
    datacenter: String,
    ram: u64,
    #[serde(default)]
    headnode: bool,
    #[serde(default)]
    sysinfo: WireSysinfo,
}

#[derive(Debug, Default, Deserialize)]
struct WireSysinfo {
    #[serde(default)]
    admin_ip: Option<String>,
}

impl HttpInventory {
    pub fn new(config: HttpInventoryConfig) -> Result<Self, InventoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, InventoryError> {
        debug!(url, "inventory request");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl InventoryApi for HttpInventory {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, InventoryError> {
        let url = format!("{}/applications", self.config.registry_url);
        let mut apps: Vec<Application> = self.get_json(&url, &[("name", name)]).await?;
        if apps.len() > 1 {
            return Err(InventoryError::BadResponse {
                url,
                message: format!("{} applications named {}", apps.len(), name),
            });
        }
        Ok(apps.pop())
    }

    async fn list_services(&self, app_uuid: &str) -> Result<Vec<ServiceRecord>, InventoryError> {
        let url = format!("{}/services", self.config.registry_url);
        self.get_json(&url, &[("application_uuid", app_uuid)]).await
    }

    async fn list_instances(&self, app_uuid: &str) -> Result<Vec<InstanceRecord>, InventoryError> {
        let url = format!("{}/instances", self.config.registry_url);
        self.get_json(&url, &[("application_uuid", app_uuid)]).await
    }

    async fn list_active_vms(&self, owner: &str) -> Result<Vec<VmRecord>, InventoryError> {
        let url = format!("{}/vms", self.config.vms_url);
        self.get_json(&url, &[("owner_uuid", owner), ("state", "active")])
            .await
    }

    async fn list_destroyed_vms(&self, owner: &str) -> Result<Vec<VmRecord>, InventoryError> {
        let url = format!("{}/vms", self.config.vms_url);
        self.get_json(&url, &[("owner_uuid", owner), ("state", "destroyed")])
            .await
    }

    async fn get_compute_node(
        &self,
        compute_id: &ComputeId,
    ) -> Result<Option<ComputeNodeRecord>, InventoryError> {
        let url = format!("{}/servers/{}", self.config.cn_url, compute_id);
        debug!(%url, "compute node lookup");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: WireComputeNode = response.error_for_status()?.json().await?;
        Ok(Some(flatten_cn(wire)))
    }

    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNodeRecord>, InventoryError> {
        let url = format!("{}/servers", self.config.cn_url);
        let wire: Vec<WireComputeNode> = self.get_json(&url, &[]).await?;
        Ok(wire.into_iter().map(flatten_cn).collect())
    }

    async fn list_images(&self, service: &str) -> Result<Vec<ImageRecord>, InventoryError> {
        let url = format!("{}/images", self.config.images_url);
        self.get_json(&url, &[("tag", service)]).await
    }

    async fn update_app_metadata(
        &self,
        app_uuid: &str,
        key: &str,
        value: Value,
    ) -> Result<(), InventoryError> {
        let url = format!("{}/applications/{}/metadata", self.config.registry_url, app_uuid);
        debug!(%url, key, "updating application metadata");
        let body = HashMap::from([(key.to_string(), value)]);
        self.client
            .put(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn flatten_cn(wire: WireComputeNode) -> ComputeNodeRecord {
    ComputeNodeRecord {
        uuid: wire.uuid,
        hostname: wire.hostname,
        datacenter: wire.datacenter,
        ram: wire.ram,
        headnode: wire.headnode,
        admin_ip: wire.sysinfo.admin_ip,
    }
}
