use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(s: impl Into<String>) -> Self {
        InstanceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a physical compute node. The pseudo id [`ComputeId::ANY`]
/// means the placement is unpinned and the backend chooses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputeId(pub String);

impl ComputeId {
    pub const ANY: &'static str = "<any>";

    pub fn new(s: impl Into<String>) -> Self {
        ComputeId(s.into())
    }

    pub fn any() -> Self {
        ComputeId(Self::ANY.to_string())
    }

    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComputeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(s: impl Into<String>) -> Self {
        ImageId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl ServiceName {
    /// Construct a service name, rejecting names absent from the catalog.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        if !catalog::is_valid(s) {
            return Err(DomainError::UnknownService(s.to_string()));
        }
        Ok(ServiceName(s.to_string()))
    }

    /// Construct without catalog validation. For callers that have already
    /// validated, or that enumerate the catalog itself.
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        ServiceName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Config keys ───────────────────────────────────────────────────────────────

/// The tuple of properties that identify one variant of a service: image
/// alone for most services, shard plus image for sharded ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    Image { image: ImageId },
    ShardImage { shard: u32, image: ImageId },
}

impl ConfigKey {
    pub fn image(&self) -> &ImageId {
        match self {
            ConfigKey::Image { image } => image,
            ConfigKey::ShardImage { image, .. } => image,
        }
    }

    pub fn shard(&self) -> Option<u32> {
        match self {
            ConfigKey::Image { .. } => None,
            ConfigKey::ShardImage { shard, .. } => Some(*shard),
        }
    }

    /// Everything before the image: the per-shard prefix that isolates one
    /// shard's provision/deprovision sequence from another's.
    pub fn prefix(&self) -> Option<u32> {
        self.shard()
    }

    /// The same key with a different image. Used when an image change is
    /// collapsed into a reprovision.
    pub fn with_image(&self, image: ImageId) -> ConfigKey {
        match self {
            ConfigKey::Image { .. } => ConfigKey::Image { image },
            ConfigKey::ShardImage { shard, .. } => ConfigKey::ShardImage {
                shard: *shard,
                image,
            },
        }
    }

    /// Check that this key has the shape the catalog declares for `service`.
    pub fn validate_for(&self, service: &str) -> Result<(), DomainError> {
        let sharded = catalog::is_sharded(service)?;
        match (self, sharded) {
            (ConfigKey::ShardImage { .. }, true) | (ConfigKey::Image { .. }, false) => Ok(()),
            (ConfigKey::Image { .. }, true) => Err(DomainError::ShardRequired {
                service: service.to_string(),
            }),
            (ConfigKey::ShardImage { .. }, false) => Err(DomainError::ShardUnexpected {
                service: service.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigKey::Image { image } => write!(f, "{}", image),
            ConfigKey::ShardImage { shard, image } => write!(f, "{}/{}", shard, image),
        }
    }
}

// ── Fleet records ─────────────────────────────────────────────────────────────

/// One member of a service, joined from the registry, VM, and compute-node
/// inventories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub service: ServiceName,
    /// Hosting compute node. None means the instance lives in another
    /// datacenter and has no local VM record.
    pub host_compute: Option<ComputeId>,
    pub primary_address: Option<String>,
    pub image: ImageId,
    /// Shard number, present only for instances of sharded services.
    pub shard: Option<u32>,
    pub datacenter: String,
    /// String-keyed metadata: an environment source for checks and the home
    /// of coordination-store identifiers.
    pub metadata: HashMap<String, String>,
    /// Only set for storage instances.
    pub storage_id: Option<String>,
}

impl Instance {
    /// The config key this instance occupies in the observed layout.
    pub fn config_key(&self) -> ConfigKey {
        match self.shard {
            Some(shard) => ConfigKey::ShardImage {
                shard,
                image: self.image.clone(),
            },
            None => ConfigKey::Image {
                image: self.image.clone(),
            },
        }
    }

    /// Whether the instance is hosted in this datacenter.
    pub fn is_local(&self) -> bool {
        self.host_compute.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub compute_id: ComputeId,
    pub hostname: String,
    pub datacenter: String,
    pub admin_address: Option<String>,
    /// Physical memory in mebibytes.
    pub ram: u64,
    /// True iff at least one storage instance is hosted here. Derived by the
    /// inventory loader.
    pub is_storage_host: bool,
    /// Storage ids aggregated from hosted storage instances.
    pub storage_ids: Vec<String>,
    /// True iff this is the head node of the deployment.
    pub headnode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub image_id: ImageId,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_key_shape_follows_catalog() {
        let sharded = ConfigKey::ShardImage {
            shard: 1,
            image: ImageId::new("img-a"),
        };
        let plain = ConfigKey::Image {
            image: ImageId::new("img-a"),
        };

        assert!(sharded.validate_for("moray").is_ok());
        assert!(plain.validate_for("moray").is_err());
        assert!(plain.validate_for("medusa").is_ok());
        assert!(sharded.validate_for("medusa").is_err());
        assert!(plain.validate_for("nosuchsvc").is_err());
    }

    #[test]
    fn instance_config_key_carries_shard() {
        let inst = Instance {
            instance_id: InstanceId::new("i-1"),
            service: ServiceName::new_unchecked("moray"),
            host_compute: Some(ComputeId::new("cn1")),
            primary_address: Some("10.0.0.5".into()),
            image: ImageId::new("img-a"),
            shard: Some(2),
            datacenter: "dc-east-1".into(),
            metadata: HashMap::new(),
            storage_id: None,
        };
        assert_eq!(
            inst.config_key(),
            ConfigKey::ShardImage {
                shard: 2,
                image: ImageId::new("img-a")
            }
        );
        assert!(inst.is_local());
    }

    #[test]
    fn any_compute_id_is_recognised() {
        assert!(ComputeId::any().is_any());
        assert!(!ComputeId::new("cn1").is_any());
    }
}
