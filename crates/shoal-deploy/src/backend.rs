use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use shoal_domain::{ComputeId, ImageId, InstanceId, ServiceName};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("provision failed: {0}")]
    ProvisionFailed(String),

    #[error("deprovision failed: {0}")]
    DeprovisionFailed(String),

    #[error("reprovision failed: {0}")]
    ReprovisionFailed(String),

    #[error("provisioning backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub service: ServiceName,
    pub image: ImageId,
    /// None means unpinned: the backend chooses placement.
    pub compute: Option<ComputeId>,
    pub shard: Option<u32>,
}

/// The provisioning system the executor drives. Each call is atomic from the
/// executor's point of view; the backend is safe to call concurrently for
/// distinct instances.
#[async_trait]
pub trait ProvisionBackend: Send + Sync + 'static {
    async fn provision(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError>;

    async fn deprovision(&self, instance: &InstanceId) -> Result<(), BackendError>;

    async fn reprovision(
        &self,
        instance: &InstanceId,
        new_image: &ImageId,
    ) -> Result<(), BackendError>;
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Registry base URL; the registry fronts the provisioning system.
    pub base_url: String,
    pub request_timeout: std::time::Duration,
}

/// HTTP implementation of [`ProvisionBackend`] against the registry's
/// provisioning endpoints.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct ProvisionResponse {
    uuid: String,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ProvisionBackend for HttpBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError> {
        let url = format!("{}/provision", self.config.base_url);
        let body = serde_json::json!({
            "service": request.service.as_str(),
            "image": request.image.as_str(),
            "compute": request.compute.as_ref().map(|c| c.as_str()),
            "shard": request.shard,
        });
        let response: ProvisionResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::ProvisionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::ProvisionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| BackendError::ProvisionFailed(e.to_string()))?;
        Ok(InstanceId::new(response.uuid))
    }

    async fn deprovision(&self, instance: &InstanceId) -> Result<(), BackendError> {
        let url = format!("{}/instances/{}", self.config.base_url, instance);
        self.client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BackendError::DeprovisionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::DeprovisionFailed(e.to_string()))?;
        Ok(())
    }

    async fn reprovision(
        &self,
        instance: &InstanceId,
        new_image: &ImageId,
    ) -> Result<(), BackendError> {
        let url = format!("{}/instances/{}/reprovision", self.config.base_url, instance);
        let body = serde_json::json!({ "image": new_image.as_str() });
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::ReprovisionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::ReprovisionFailed(e.to_string()))?;
        Ok(())
    }
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Provision(ProvisionRequest),
    Deprovision(InstanceId),
    Reprovision(InstanceId, ImageId),
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<BackendCall>,
    next_id: u64,
}

/// Backend that records calls instead of provisioning anything. Backs tests
/// and offline rehearsals; failures can be injected per service or instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    fail_services: HashSet<String>,
    fail_instances: HashSet<InstanceId>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_service(mut self, service: &str) -> Self {
        self.fail_services.insert(service.to_string());
        self
    }

    pub fn fail_instance(mut self, instance: &str) -> Self {
        self.fail_instances.insert(InstanceId::new(instance));
        self
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().await.calls.clone()
    }
}

#[async_trait]
impl ProvisionBackend for MemoryBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError> {
        if self.fail_services.contains(request.service.as_str()) {
            return Err(BackendError::ProvisionFailed(format!(
                "injected failure for {}",
                request.service
            )));
        }
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = InstanceId::new(format!("i-new-{}", inner.next_id));
        debug!(instance = %id, service = %request.service, "memory backend provision");
        inner.calls.push(BackendCall::Provision(request.clone()));
        Ok(id)
    }

    async fn deprovision(&self, instance: &InstanceId) -> Result<(), BackendError> {
        if self.fail_instances.contains(instance) {
            return Err(BackendError::DeprovisionFailed(format!(
                "injected failure for {}",
                instance
            )));
        }
        let mut inner = self.inner.lock().await;
        inner.calls.push(BackendCall::Deprovision(instance.clone()));
        Ok(())
    }

    async fn reprovision(
        &self,
        instance: &InstanceId,
        new_image: &ImageId,
    ) -> Result<(), BackendError> {
        if self.fail_instances.contains(instance) {
            return Err(BackendError::ReprovisionFailed(format!(
                "injected failure for {}",
                instance
            )));
        }
        let mut inner = self.inner.lock().await;
        inner
            .calls
            .push(BackendCall::Reprovision(instance.clone(), new_image.clone()));
        Ok(())
    }
}
