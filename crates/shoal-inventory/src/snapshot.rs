use std::collections::{BTreeMap, HashMap, HashSet};

use futures::stream::{self, StreamExt};
use shoal_domain::{
    catalog, ComputeId, ComputeNode, ConfigKey, Image, ImageId, Instance, InstanceId, ServiceName,
};
use tracing::{debug, info, warn};

use crate::api::{Application, InventoryApi, VmRecord};
use crate::error::InventoryError;

/// VM tag marking fleet membership. VMs without it are ignored by the loader.
pub const MEMBERSHIP_TAG: &str = "shoal_role";

/// Instance-metadata key naming the shard of a sharded service's member.
pub const SHARD_KEY: &str = "shard";

/// Instance-metadata key naming the home datacenter of a remote instance.
pub const DATACENTER_KEY: &str = "datacenter";

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Well-known name of the fleet application in the registry.
    pub application: String,
    /// Maximum concurrent compute-node lookups.
    pub concurrency: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            application: "shoal".to_string(),
            concurrency: 50,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Per-service instance counters, total and per compute node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCounts {
    pub total: BTreeMap<ConfigKey, usize>,
    pub per_compute: BTreeMap<ComputeId, BTreeMap<ConfigKey, usize>>,
}

/// A consistent view of the fleet, assembled once per invocation and
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub application: Application,
    /// Sorted by (catalog order, shard, datacenter, instance id) so every
    /// walk over instances is deterministic.
    pub instances: Vec<Instance>,
    pub compute_nodes: BTreeMap<ComputeId, ComputeNode>,
    pub images: HashMap<ImageId, Image>,
    /// Newest published image per service, for layout generation.
    pub latest_images: HashMap<ServiceName, ImageId>,
    by_config: BTreeMap<ServiceName, ServiceCounts>,
}

impl FleetSnapshot {
    pub fn instance(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances.iter().find(|i| &i.instance_id == id)
    }

    pub fn instances_of<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Instance> {
        self.instances
            .iter()
            .filter(move |i| i.service.as_str() == service)
    }

    pub fn local_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.is_local())
    }

    pub fn compute_node(&self, id: &ComputeId) -> Option<&ComputeNode> {
        self.compute_nodes.get(id)
    }

    pub fn compute_node_by_hostname(&self, hostname: &str) -> Option<&ComputeNode> {
        self.compute_nodes.values().find(|cn| cn.hostname == hostname)
    }

    /// The unique head node, if exactly one exists.
    pub fn head_node(&self) -> Option<&ComputeNode> {
        let mut heads = self.compute_nodes.values().filter(|cn| cn.headnode);
        match (heads.next(), heads.next()) {
            (Some(cn), None) => Some(cn),
            _ => None,
        }
    }

    pub fn counts(&self, service: &str) -> Option<&ServiceCounts> {
        self.by_config.get(&ServiceName::new_unchecked(service))
    }

    /// Human-readable version of an image, `-` when the image registry did
    /// not return it.
    pub fn image_version(&self, image: &ImageId) -> &str {
        self.images.get(image).map(|i| i.version.as_str()).unwrap_or("-")
    }

    /// Group local instances into the observed layout shape consumed by the
    /// planner: compute → service → config key → count.
    pub fn observed_layout(
        &self,
    ) -> BTreeMap<ComputeId, BTreeMap<ServiceName, BTreeMap<ConfigKey, usize>>> {
        let mut out: BTreeMap<ComputeId, BTreeMap<ServiceName, BTreeMap<ConfigKey, usize>>> =
            BTreeMap::new();
        for inst in self.local_instances() {
            let compute = inst.host_compute.clone().unwrap_or_else(ComputeId::any);
            *out.entry(compute)
                .or_default()
                .entry(inst.service.clone())
                .or_default()
                .entry(inst.config_key())
                .or_default() += 1;
        }
        out
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

/// Assemble the fleet snapshot from the upstream inventories.
///
/// Fails fast on upstream errors, with two tolerated gaps: unknown compute
/// nodes (instance recorded as remote) and missing images (version rendered
/// as `-`).
pub async fn load_snapshot(
    api: &dyn InventoryApi,
    opts: &LoaderOptions,
) -> Result<FleetSnapshot, InventoryError> {
    info!(application = %opts.application, "loading fleet snapshot");

    let application = api
        .get_application(&opts.application)
        .await?
        .ok_or_else(|| InventoryError::ApplicationNotFound(opts.application.clone()))?;

    let services = api.list_services(&application.uuid).await?;
    let mut service_names: HashMap<String, ServiceName> = HashMap::new();
    for svc in &services {
        let name = ServiceName::parse(&svc.name)?;
        service_names.insert(svc.uuid.clone(), name);
    }

    let registry_instances = api.list_instances(&application.uuid).await?;
    debug!(
        services = services.len(),
        instances = registry_instances.len(),
        "registry records loaded"
    );

    let vms: HashMap<String, VmRecord> = api
        .list_active_vms(&application.owner_account)
        .await?
        .into_iter()
        .filter(|vm| vm.tags.contains_key(MEMBERSHIP_TAG))
        .map(|vm| (vm.uuid.clone(), vm))
        .collect();

    // Compute-node lookups fan out with a bounded pool. Not-found is
    // tolerated: the instance is recorded as remote.
    let cn_ids: Vec<ComputeId> = vms
        .values()
        .filter_map(|vm| vm.server_uuid.as_deref())
        .map(ComputeId::new)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let cn_records: Vec<_> = stream::iter(cn_ids)
        .map(|id| async move {
            let rec = api.get_compute_node(&id).await?;
            Ok::<_, InventoryError>((id, rec))
        })
        .buffer_unordered(opts.concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut compute_nodes: BTreeMap<ComputeId, ComputeNode> = BTreeMap::new();
    for result in cn_records {
        let (id, rec) = result?;
        match rec {
            Some(rec) => {
                compute_nodes.insert(id, to_compute_node(rec));
            }
            None => warn!(compute_id = %id, "compute node unknown to local inventory"),
        }
    }

    // The full listing adds nodes hosting no instances yet. Needed by layout
    // generation (head node) and compute-node reporting.
    for rec in api.list_compute_nodes().await? {
        let id = ComputeId::new(&rec.uuid);
        compute_nodes.entry(id).or_insert_with(|| to_compute_node(rec));
    }

    // Join registry and VM records into instances.
    let mut instances: Vec<Instance> = Vec::with_capacity(registry_instances.len());
    let mut seen: HashSet<String> = HashSet::new();
    for rec in registry_instances {
        if !seen.insert(rec.uuid.clone()) {
            return Err(InventoryError::DuplicateInstance(rec.uuid));
        }
        let service = service_names
            .get(&rec.service_uuid)
            .cloned()
            .ok_or_else(|| InventoryError::DanglingServiceRef {
                instance: rec.uuid.clone(),
                service_uuid: rec.service_uuid.clone(),
            })?;

        let vm = vms.get(&rec.uuid);
        let mut metadata: HashMap<String, String> =
            vm.map(|vm| vm.metadata.clone()).unwrap_or_default();
        metadata.extend(rec.metadata.clone());

        let host_compute = vm
            .and_then(|vm| vm.server_uuid.as_deref())
            .map(ComputeId::new)
            .filter(|id| compute_nodes.contains_key(id));

        let image = match vm {
            Some(vm) => ImageId::new(&vm.image_uuid),
            None => ImageId::new(metadata.get("image").cloned().unwrap_or_default()),
        };

        let sharded = catalog::is_sharded(service.as_str())?;
        let shard = if sharded {
            let raw = metadata.get(SHARD_KEY).ok_or_else(|| {
                InventoryError::Internal(format!(
                    "instance {} of sharded service {} has no shard metadata",
                    rec.uuid, service
                ))
            })?;
            Some(raw.parse::<u32>().map_err(|_| {
                shoal_domain::DomainError::InvalidShard(raw.clone())
            })?)
        } else {
            None
        };

        let datacenter = host_compute
            .as_ref()
            .and_then(|id| compute_nodes.get(id))
            .map(|cn| cn.datacenter.clone())
            .or_else(|| metadata.get(DATACENTER_KEY).cloned())
            .unwrap_or_else(|| "-".to_string());

        let storage_id = if service.as_str() == catalog::STORAGE {
            metadata.get("storage_id").cloned()
        } else {
            None
        };

        instances.push(Instance {
            instance_id: InstanceId::new(&rec.uuid),
            service,
            host_compute,
            primary_address: vm.and_then(|vm| vm.primary_ip.clone()),
            image,
            shard,
            datacenter,
            metadata,
            storage_id,
        });
    }

    // Storage-host derivation.
    for inst in &instances {
        if inst.service.as_str() != catalog::STORAGE {
            continue;
        }
        if let Some(cn) = inst
            .host_compute
            .as_ref()
            .and_then(|id| compute_nodes.get_mut(id))
        {
            cn.is_storage_host = true;
            if let Some(sid) = &inst.storage_id {
                cn.storage_ids.push(sid.clone());
            }
        }
    }
    for cn in compute_nodes.values_mut() {
        cn.storage_ids.sort();
    }

    // Image versions, best-effort: a service with no published image just
    // renders as `-`. The listing is version-ordered upstream; the last
    // record is the newest.
    let mut images: HashMap<ImageId, Image> = HashMap::new();
    let mut latest_images: HashMap<ServiceName, ImageId> = HashMap::new();
    for svc in &services {
        match api.list_images(&svc.name).await {
            Ok(records) => {
                if let Some(last) = records.last() {
                    latest_images.insert(
                        ServiceName::new_unchecked(&svc.name),
                        ImageId::new(&last.uuid),
                    );
                }
                for rec in records {
                    images.insert(
                        ImageId::new(&rec.uuid),
                        Image {
                            image_id: ImageId::new(&rec.uuid),
                            version: rec.version,
                        },
                    );
                }
            }
            Err(err) => warn!(service = %svc.name, error = %err, "image listing failed"),
        }
    }

    instances.sort_by(|a, b| {
        let ka = (
            catalog::ordinal(a.service.as_str()).unwrap_or(usize::MAX),
            a.shard,
            a.datacenter.clone(),
            a.instance_id.clone(),
        );
        let kb = (
            catalog::ordinal(b.service.as_str()).unwrap_or(usize::MAX),
            b.shard,
            b.datacenter.clone(),
            b.instance_id.clone(),
        );
        ka.cmp(&kb)
    });

    let mut by_config: BTreeMap<ServiceName, ServiceCounts> = BTreeMap::new();
    for inst in instances.iter().filter(|i| i.is_local()) {
        let counts = by_config.entry(inst.service.clone()).or_default();
        let key = inst.config_key();
        *counts.total.entry(key.clone()).or_default() += 1;
        if let Some(compute) = &inst.host_compute {
            *counts
                .per_compute
                .entry(compute.clone())
                .or_default()
                .entry(key)
                .or_default() += 1;
        }
    }

    info!(
        instances = instances.len(),
        compute_nodes = compute_nodes.len(),
        "fleet snapshot loaded"
    );

    Ok(FleetSnapshot {
        application,
        instances,
        compute_nodes,
        images,
        latest_images,
        by_config,
    })
}

fn to_compute_node(rec: crate::api::ComputeNodeRecord) -> ComputeNode {
    ComputeNode {
        compute_id: ComputeId::new(&rec.uuid),
        hostname: rec.hostname,
        datacenter: rec.datacenter,
        admin_address: rec.admin_ip,
        ram: rec.ram,
        is_storage_host: false,
        storage_ids: Vec::new(),
        headnode: rec.headnode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryInventory;

    #[tokio::test]
    async fn loads_and_joins_a_small_fleet() {
        let inv = MemoryInventory::builder()
            .service("moray")
            .service("storage")
            .instance("i-moray-1", "moray", "cn1", "img-a", &[("shard", "1")])
            .instance(
                "i-stor-1",
                "storage",
                "cn1",
                "img-s",
                &[("storage_id", "1.stor.example.com")],
            )
            .compute_node("cn1", "host01", true)
            .image("img-a", "moray", "1.2.3")
            .build();

        let snap = load_snapshot(&inv, &LoaderOptions::default()).await.unwrap();
        assert_eq!(snap.instances.len(), 2);

        let moray = snap.instance(&InstanceId::new("i-moray-1")).unwrap();
        assert_eq!(moray.shard, Some(1));
        assert_eq!(moray.host_compute, Some(ComputeId::new("cn1")));

        let cn = snap.compute_node(&ComputeId::new("cn1")).unwrap();
        assert!(cn.is_storage_host);
        assert_eq!(cn.storage_ids, vec!["1.stor.example.com".to_string()]);

        assert_eq!(snap.image_version(&ImageId::new("img-a")), "1.2.3");
        assert_eq!(snap.image_version(&ImageId::new("img-missing")), "-");
    }

    #[tokio::test]
    async fn duplicate_instance_ids_fail_the_load() {
        let inv = MemoryInventory::builder()
            .service("moray")
            .instance("i-1", "moray", "cn1", "img-a", &[("shard", "1")])
            .instance("i-1", "moray", "cn1", "img-a", &[("shard", "1")])
            .compute_node("cn1", "host01", true)
            .build();

        let err = load_snapshot(&inv, &LoaderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateInstance(_)));
    }

    #[tokio::test]
    async fn unknown_compute_node_marks_instance_remote() {
        let inv = MemoryInventory::builder()
            .service("medusa")
            .instance("i-1", "medusa", "cn-elsewhere", "img-m", &[])
            .build();

        let snap = load_snapshot(&inv, &LoaderOptions::default()).await.unwrap();
        let inst = snap.instance(&InstanceId::new("i-1")).unwrap();
        assert!(!inst.is_local());
        assert_eq!(inst.datacenter, "-");
    }

    #[tokio::test]
    async fn missing_application_is_fatal() {
        let inv = MemoryInventory::builder().build();
        let opts = LoaderOptions {
            application: "nosuch".to_string(),
            ..Default::default()
        };
        let err = load_snapshot(&inv, &opts).await.unwrap_err();
        assert!(matches!(err, InventoryError::ApplicationNotFound(_)));
    }

    #[tokio::test]
    async fn observed_layout_groups_by_compute_and_service() {
        let inv = MemoryInventory::builder()
            .service("moray")
            .instance("i-1", "moray", "cn1", "img-a", &[("shard", "1")])
            .instance("i-2", "moray", "cn1", "img-a", &[("shard", "1")])
            .instance("i-3", "moray", "cn2", "img-a", &[("shard", "2")])
            .compute_node("cn1", "host01", true)
            .compute_node("cn2", "host02", false)
            .build();

        let snap = load_snapshot(&inv, &LoaderOptions::default()).await.unwrap();
        let observed = snap.observed_layout();
        let cn1 = &observed[&ComputeId::new("cn1")][&ServiceName::new_unchecked("moray")];
        assert_eq!(
            cn1[&ConfigKey::ShardImage { shard: 1, image: ImageId::new("img-a") }],
            2
        );
        let counts = snap.counts("moray").unwrap();
        assert_eq!(counts.total.values().sum::<usize>(), 3);
    }
}
