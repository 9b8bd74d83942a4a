use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use shoal_domain::{catalog, ComputeId, ConfigKey, ImageId, InstanceId, ServiceName};
use shoal_inventory::FleetSnapshot;
use shoal_layout::DesiredLayout;
use tracing::debug;

use crate::error::DeployError;

// ── Operations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Provision {
        service: ServiceName,
        config: ConfigKey,
        /// Target compute node, possibly `<any>` for unpinned placement.
        compute: ComputeId,
        reason: String,
    },
    Deprovision {
        service: ServiceName,
        config: ConfigKey,
        /// The hosting compute node of the bound instance.
        compute: ComputeId,
        instance_id: InstanceId,
        reason: String,
    },
    Reprovision {
        service: ServiceName,
        compute: ComputeId,
        instance_id: InstanceId,
        old_image: ImageId,
        new_image: ImageId,
        shard: Option<u32>,
        reason: String,
    },
}

impl Operation {
    pub fn service(&self) -> &ServiceName {
        match self {
            Operation::Provision { service, .. } => service,
            Operation::Deprovision { service, .. } => service,
            Operation::Reprovision { service, .. } => service,
        }
    }

    pub fn compute(&self) -> &ComputeId {
        match self {
            Operation::Provision { compute, .. } => compute,
            Operation::Deprovision { compute, .. } => compute,
            Operation::Reprovision { compute, .. } => compute,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Provision { .. } => "provision",
            Operation::Deprovision { .. } => "deprovision",
            Operation::Reprovision { .. } => "reprovision",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Provision {
                service,
                config,
                compute,
                ..
            } => write!(f, "+ {} {} on {}", service, config, compute),
            Operation::Deprovision {
                service,
                instance_id,
                ..
            } => write!(f, "- {} {}", service, instance_id),
            Operation::Reprovision {
                service,
                instance_id,
                old_image,
                new_image,
                ..
            } => write!(f, "~ {} {} {} -> {}", service, instance_id, old_image, new_image),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Restrict changes to one service; others are ignored entirely.
    pub service: Option<String>,
    /// When false, every image change expands into a provision/deprovision
    /// pair instead of a single reprovision.
    pub allow_reprovision: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            service: None,
            allow_reprovision: true,
        }
    }
}

/// A deprovision bound to one concrete observed instance.
#[derive(Debug, Clone)]
struct BoundDeprovision {
    config: ConfigKey,
    instance_id: InstanceId,
    compute: ComputeId,
    reason: String,
}

// ── Planner ──────────────────────────────────────────────────────────────────

/// Diff the observed fleet against the desired layout and emit the ordered
/// operation list that converges one onto the other.
///
/// Emission is a pure function of its inputs: the same snapshot and layout
/// always produce the same plan, and `plan(observed, observed)` is empty.
pub fn plan(
    snapshot: &FleetSnapshot,
    desired: &DesiredLayout,
    opts: &PlanOptions,
) -> Result<Vec<Operation>, DeployError> {
    if let Some(svc) = &opts.service {
        if !catalog::is_valid(svc) {
            return Err(DeployError::UnknownService(svc.clone()));
        }
    }

    let any_mode = desired.uses_any();

    // In unpinned mode the observed layout is compared against totals across
    // compute nodes, so collapse it under the `<any>` pseudo id.
    let observed = {
        let raw = snapshot.observed_layout();
        if any_mode {
            let mut all: BTreeMap<ServiceName, BTreeMap<ConfigKey, usize>> = BTreeMap::new();
            for (_, services) in raw {
                for (svc, cfgs) in services {
                    let entry = all.entry(svc).or_default();
                    for (key, n) in cfgs {
                        *entry.entry(key).or_default() += n;
                    }
                }
            }
            BTreeMap::from([(ComputeId::any(), all)])
        } else {
            raw
        }
    };

    let desired_computes: BTreeSet<ComputeId> = desired.computes().cloned().collect();
    let mut ops: Vec<Operation> = Vec::new();
    let mut already_bound: HashSet<InstanceId> = HashSet::new();

    // Catalog order keeps the overall plan stable.
    for service in catalog::all() {
        if opts.service.as_deref().is_some_and(|only| only != service) {
            continue;
        }
        let svc_name = ServiceName::new_unchecked(service);

        let mut computes: BTreeSet<ComputeId> = BTreeSet::new();
        for compute in desired.computes() {
            if desired
                .services_on(compute)
                .is_some_and(|m| m.contains_key(&svc_name))
            {
                computes.insert(compute.clone());
            }
        }
        for (compute, services) in &observed {
            if services.contains_key(&svc_name) {
                computes.insert(compute.clone());
            }
        }

        for compute in computes {
            let desired_cfgs: BTreeMap<ConfigKey, usize> = desired
                .services_on(&compute)
                .and_then(|m| m.get(&svc_name))
                .cloned()
                .unwrap_or_default();
            let observed_cfgs: BTreeMap<ConfigKey, usize> = observed
                .get(&compute)
                .and_then(|m| m.get(&svc_name))
                .cloned()
                .unwrap_or_default();

            let compute_dropped = !any_mode && !desired_computes.contains(&compute);

            // Count deltas per config key. One provision entry per unit so
            // pairing and interleaving work on flat sequences.
            let mut provisions: Vec<(ConfigKey, String)> = Vec::new();
            let mut wanted_removals: Vec<(ConfigKey, usize, String)> = Vec::new();
            for (key, want) in &desired_cfgs {
                let have = observed_cfgs.get(key).copied().unwrap_or(0);
                if *want > have {
                    let reason = format!("have {}, want {}", have, want);
                    for _ in 0..(*want - have) {
                        provisions.push((key.clone(), reason.clone()));
                    }
                } else if *want < have {
                    wanted_removals.push((
                        key.clone(),
                        have - *want,
                        format!("have {}, want {}", have, want),
                    ));
                }
            }
            for (key, have) in &observed_cfgs {
                if desired_cfgs.contains_key(key) {
                    continue;
                }
                let reason = if compute_dropped {
                    "compute node not in desired layout"
                } else {
                    "configuration no longer desired"
                };
                wanted_removals.push((key.clone(), *have, reason.to_string()));
            }

            if provisions.is_empty() && wanted_removals.is_empty() {
                continue;
            }
            debug!(
                service,
                compute = %compute,
                provisions = provisions.len(),
                "planning changes"
            );

            // Bind each deprovision to a concrete instance. The instance
            // list is sorted, so binding is deterministic.
            let mut deprovisions: Vec<BoundDeprovision> = Vec::new();
            for (key, needed, reason) in wanted_removals {
                let mut taken = 0;
                for inst in &snapshot.instances {
                    if taken == needed {
                        break;
                    }
                    if inst.service != svc_name || inst.config_key() != key {
                        continue;
                    }
                    let Some(host) = inst.host_compute.clone() else {
                        continue;
                    };
                    if !compute.is_any() && host != compute {
                        continue;
                    }
                    if !already_bound.insert(inst.instance_id.clone()) {
                        continue;
                    }
                    deprovisions.push(BoundDeprovision {
                        config: key.clone(),
                        instance_id: inst.instance_id.clone(),
                        compute: host,
                        reason: reason.clone(),
                    });
                    taken += 1;
                }
                if taken < needed {
                    return Err(DeployError::Internal(format!(
                        "service {}: bound only {} of {} deprovisions for {}",
                        service, taken, needed, key
                    )));
                }
            }

            // Partition by the config-key prefix so each shard's sequence
            // stays isolated, then pair and interleave within the partition.
            let mut partitions: BTreeMap<
                Option<u32>,
                (VecDeque<(ConfigKey, String)>, VecDeque<BoundDeprovision>),
            > = BTreeMap::new();
            for p in provisions {
                partitions.entry(p.0.prefix()).or_default().0.push_back(p);
            }
            for d in deprovisions {
                partitions.entry(d.config.prefix()).or_default().1.push_back(d);
            }

            for (shard, (mut provs, mut deps)) in partitions {
                if opts.allow_reprovision {
                    while !provs.is_empty() && !deps.is_empty() {
                        let Some((pkey, _)) = provs.pop_front() else { break };
                        let Some(d) = deps.pop_front() else { break };
                        ops.push(Operation::Reprovision {
                            service: svc_name.clone(),
                            compute: d.compute,
                            instance_id: d.instance_id,
                            old_image: d.config.image().clone(),
                            new_image: pkey.image().clone(),
                            shard,
                            reason: "image update".to_string(),
                        });
                    }
                }
                // Interleave one-for-one, provision first, then drain the
                // longer side.
                loop {
                    let p = provs.pop_front();
                    let d = deps.pop_front();
                    if p.is_none() && d.is_none() {
                        break;
                    }
                    if let Some((key, reason)) = p {
                        ops.push(Operation::Provision {
                            service: svc_name.clone(),
                            config: key,
                            compute: compute.clone(),
                            reason,
                        });
                    }
                    if let Some(d) = d {
                        ops.push(Operation::Deprovision {
                            service: svc_name.clone(),
                            config: d.config,
                            compute: d.compute,
                            instance_id: d.instance_id,
                            reason: d.reason,
                        });
                    }
                }
            }
        }
    }

    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_inventory::{load_snapshot, LoaderOptions, MemoryInventory, MemoryInventoryBuilder};

    fn moray_on(builder: MemoryInventoryBuilder, uuid: &str, cn: &str, image: &str, shard: &str) -> MemoryInventoryBuilder {
        builder.instance(uuid, "moray", cn, image, &[("shard", shard)])
    }

    async fn snapshot(builder: MemoryInventoryBuilder) -> FleetSnapshot {
        load_snapshot(&builder.build(), &LoaderOptions::default())
            .await
            .unwrap()
    }

    fn sharded(shard: u32, image: &str) -> ConfigKey {
        ConfigKey::ShardImage {
            shard,
            image: ImageId::new(image),
        }
    }

    fn plain(image: &str) -> ConfigKey {
        ConfigKey::Image {
            image: ImageId::new(image),
        }
    }

    fn layout(entries: &[(&str, &str, ConfigKey, usize)]) -> DesiredLayout {
        let mut layout = DesiredLayout::new();
        for (cn, svc, key, count) in entries {
            layout
                .set_count(ComputeId::new(*cn), svc, key.clone(), *count)
                .unwrap();
        }
        layout
    }

    #[tokio::test]
    async fn identical_layouts_produce_no_operations() {
        let b = MemoryInventory::builder().service("moray").compute_node("cn1", "host01", true);
        let b = moray_on(b, "i-1", "cn1", "img-a", "1");
        let b = moray_on(b, "i-2", "cn1", "img-a", "1");
        let b = moray_on(b, "i-3", "cn1", "img-a", "1");
        let snap = snapshot(b).await;

        let desired = layout(&[("cn1", "moray", sharded(1, "img-a"), 3)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn scale_up_emits_provisions() {
        let b = MemoryInventory::builder().service("moray").compute_node("cn1", "host01", true);
        let b = moray_on(b, "i-1", "cn1", "img-a", "1");
        let b = moray_on(b, "i-2", "cn1", "img-a", "1");
        let snap = snapshot(b).await;

        let desired = layout(&[("cn1", "moray", sharded(1, "img-a"), 4)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();

        assert_eq!(ops.len(), 2);
        for op in &ops {
            match op {
                Operation::Provision {
                    service,
                    config,
                    compute,
                    ..
                } => {
                    assert_eq!(service.as_str(), "moray");
                    assert_eq!(*config, sharded(1, "img-a"));
                    assert_eq!(compute.as_str(), "cn1");
                }
                other => panic!("expected provision, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn image_upgrade_collapses_into_reprovisions() {
        let b = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .instance("i-1", "medusa", "cn1", "img-a", &[])
            .instance("i-2", "medusa", "cn1", "img-a", &[]);
        let snap = snapshot(b).await;

        let desired = layout(&[("cn1", "medusa", plain("img-b"), 2)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();

        assert_eq!(ops.len(), 2);
        for op in &ops {
            match op {
                Operation::Reprovision {
                    old_image,
                    new_image,
                    ..
                } => {
                    assert_eq!(old_image.as_str(), "img-a");
                    assert_eq!(new_image.as_str(), "img-b");
                }
                other => panic!("expected reprovision, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn image_upgrade_without_reprovision_interleaves() {
        let b = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .instance("i-1", "medusa", "cn1", "img-a", &[])
            .instance("i-2", "medusa", "cn1", "img-a", &[]);
        let snap = snapshot(b).await;

        let desired = layout(&[("cn1", "medusa", plain("img-b"), 2)]);
        let opts = PlanOptions {
            allow_reprovision: false,
            ..Default::default()
        };
        let ops = plan(&snap, &desired, &opts).unwrap();

        let kinds: Vec<&str> = ops.iter().map(|op| op.kind()).collect();
        assert_eq!(
            kinds,
            vec!["provision", "deprovision", "provision", "deprovision"]
        );
        let removed: HashSet<&str> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::Deprovision { instance_id, .. } => Some(instance_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, HashSet::from(["i-1", "i-2"]));
    }

    #[tokio::test]
    async fn shards_are_planned_independently() {
        let b = MemoryInventory::builder().service("moray").compute_node("cn1", "host01", true);
        let b = moray_on(b, "i-1", "cn1", "img-a", "1");
        let b = moray_on(b, "i-2", "cn1", "img-a", "2");
        let snap = snapshot(b).await;

        // Shard 1 upgrades; shard 2 is unchanged.
        let desired = layout(&[
            ("cn1", "moray", sharded(1, "img-b"), 1),
            ("cn1", "moray", sharded(2, "img-a"), 1),
        ]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Reprovision {
                instance_id, shard, ..
            } => {
                assert_eq!(instance_id.as_str(), "i-1");
                assert_eq!(*shard, Some(1));
            }
            other => panic!("expected reprovision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn any_layout_matches_totals_across_computes() {
        let b = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .compute_node("cn2", "host02", false)
            .instance("i-1", "medusa", "cn1", "img-a", &[])
            .instance("i-2", "medusa", "cn2", "img-a", &[]);
        let snap = snapshot(b).await;

        let desired = layout(&[("<any>", "medusa", plain("img-a"), 2)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();
        assert!(ops.is_empty(), "totals already match: {:?}", ops);

        let desired = layout(&[("<any>", "medusa", plain("img-a"), 3)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].compute().is_any());
    }

    #[tokio::test]
    async fn dropped_compute_nodes_are_drained() {
        let b = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .compute_node("cn2", "host02", false)
            .instance("i-1", "medusa", "cn1", "img-a", &[])
            .instance("i-2", "medusa", "cn2", "img-a", &[]);
        let snap = snapshot(b).await;

        let desired = layout(&[("cn1", "medusa", plain("img-a"), 1)]);
        let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Deprovision {
                instance_id,
                reason,
                ..
            } => {
                assert_eq!(instance_id.as_str(), "i-2");
                assert_eq!(reason, "compute node not in desired layout");
            }
            other => panic!("expected deprovision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn service_filter_ignores_other_services() {
        let b = MemoryInventory::builder()
            .service("medusa")
            .service("moray")
            .compute_node("cn1", "host01", true)
            .instance("i-1", "medusa", "cn1", "img-a", &[]);
        let b = moray_on(b, "i-2", "cn1", "img-a", "1");
        let snap = snapshot(b).await;

        // Desired removes both, but the filter restricts to medusa.
        let desired = DesiredLayout::new();
        let opts = PlanOptions {
            service: Some("medusa".to_string()),
            ..Default::default()
        };
        let ops = plan(&snap, &desired, &opts).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].service().as_str(), "medusa");
    }

    #[tokio::test]
    async fn unknown_service_filter_is_fatal() {
        let snap = snapshot(MemoryInventory::builder()).await;
        let opts = PlanOptions {
            service: Some("frob".to_string()),
            ..Default::default()
        };
        let err = plan(&snap, &DesiredLayout::new(), &opts).unwrap_err();
        assert!(matches!(err, DeployError::UnknownService(_)));
    }

    #[tokio::test]
    async fn planning_is_deterministic() {
        let b = MemoryInventory::builder()
            .service("moray")
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .compute_node("cn2", "host02", false)
            .instance("i-3", "medusa", "cn2", "img-m", &[]);
        let b = moray_on(b, "i-1", "cn1", "img-a", "1");
        let b = moray_on(b, "i-2", "cn2", "img-a", "2");
        let snap = snapshot(b).await;

        let desired = layout(&[
            ("cn1", "moray", sharded(1, "img-b"), 2),
            ("cn2", "moray", sharded(2, "img-a"), 1),
            ("cn1", "medusa", plain("img-m"), 1),
        ]);

        let first = plan(&snap, &desired, &PlanOptions::default()).unwrap();
        let second = plan(&snap, &desired, &PlanOptions::default()).unwrap();
        assert_eq!(first, second);
        // Catalog order: moray changes precede medusa changes.
        let services: Vec<&str> = first.iter().map(|op| op.service().as_str()).collect();
        let moray_last = services.iter().rposition(|s| *s == "moray");
        let medusa_first = services.iter().position(|s| *s == "medusa");
        if let (Some(m), Some(w)) = (moray_last, medusa_first) {
            assert!(m < w);
        }
    }
}
