//! Convergence: executing a plan against the observed fleet produces the
//! desired layout, and re-planning afterwards finds nothing left to do.

use std::collections::HashMap;

use shoal_deploy::{plan, Operation, PlanOptions};
use shoal_domain::{ComputeId, ConfigKey, ImageId};
use shoal_inventory::{load_snapshot, FleetSnapshot, LoaderOptions, MemoryInventory};
use shoal_layout::DesiredLayout;

#[derive(Debug, Clone)]
struct SimInstance {
    id: String,
    service: String,
    compute: String,
    shard: Option<u32>,
    image: String,
}

/// Apply a plan to a model of the fleet the way the provisioning backend
/// would: provisions add instances, deprovisions remove the bound instance,
/// reprovisions swap its image in place.
fn simulate(instances: &mut Vec<SimInstance>, ops: &[Operation], next_id: &mut u32) {
    for op in ops {
        match op {
            Operation::Provision {
                service,
                config,
                compute,
                ..
            } => {
                *next_id += 1;
                instances.push(SimInstance {
                    id: format!("i-sim-{}", next_id),
                    service: service.to_string(),
                    compute: compute.to_string(),
                    shard: config.shard(),
                    image: config.image().to_string(),
                });
            }
            Operation::Deprovision { instance_id, .. } => {
                let before = instances.len();
                instances.retain(|i| i.id != instance_id.as_str());
                assert_eq!(before - 1, instances.len(), "deprovision of unknown {}", instance_id);
            }
            Operation::Reprovision {
                instance_id,
                old_image,
                new_image,
                ..
            } => {
                let inst = instances
                    .iter_mut()
                    .find(|i| i.id == instance_id.as_str())
                    .unwrap_or_else(|| panic!("reprovision of unknown {}", instance_id));
                assert_eq!(inst.image, old_image.as_str());
                inst.image = new_image.as_str().to_string();
            }
        }
    }
}

async fn snapshot_of(instances: &[SimInstance]) -> FleetSnapshot {
    let mut builder = MemoryInventory::builder()
        .service("moray")
        .service("medusa")
        .service("storage")
        .compute_node("cn1", "host01", true)
        .compute_node("cn2", "host02", false)
        .compute_node("cn3", "host03", false);
    for inst in instances {
        let shard = inst.shard.map(|s| s.to_string());
        let metadata: Vec<(&str, &str)> = match &shard {
            Some(s) => vec![("shard", s.as_str())],
            None => vec![],
        };
        builder = builder.instance(&inst.id, &inst.service, &inst.compute, &inst.image, &metadata);
    }
    load_snapshot(&builder.build(), &LoaderOptions::default())
        .await
        .unwrap()
}

fn observed_counts(instances: &[SimInstance]) -> HashMap<(String, String, Option<u32>, String), usize> {
    let mut counts = HashMap::new();
    for inst in instances {
        *counts
            .entry((
                inst.compute.clone(),
                inst.service.clone(),
                inst.shard,
                inst.image.clone(),
            ))
            .or_default() += 1;
    }
    counts
}

fn sim(id: &str, service: &str, compute: &str, shard: Option<u32>, image: &str) -> SimInstance {
    SimInstance {
        id: id.to_string(),
        service: service.to_string(),
        compute: compute.to_string(),
        shard,
        image: image.to_string(),
    }
}

#[tokio::test]
async fn mixed_plan_converges_in_one_round() {
    // Observed: moray shard 1 (2x img-a on cn1), shard 2 (1x img-a on cn2),
    // medusa (1x img-m on cn1), storage on cn3 (to be drained).
    let mut instances = vec![
        sim("i-mo-1", "moray", "cn1", Some(1), "img-a"),
        sim("i-mo-2", "moray", "cn1", Some(1), "img-a"),
        sim("i-mo-3", "moray", "cn2", Some(2), "img-a"),
        sim("i-me-1", "medusa", "cn1", None, "img-m"),
        sim("i-st-1", "storage", "cn3", None, "img-s"),
    ];

    // Desired: shard 1 upgrades to img-b and shrinks to 1, shard 2 stays,
    // medusa scales to 3, storage leaves cn3 for cn2.
    let mut desired = DesiredLayout::new();
    desired
        .set_count(
            ComputeId::new("cn1"),
            "moray",
            ConfigKey::ShardImage { shard: 1, image: ImageId::new("img-b") },
            1,
        )
        .unwrap();
    desired
        .set_count(
            ComputeId::new("cn2"),
            "moray",
            ConfigKey::ShardImage { shard: 2, image: ImageId::new("img-a") },
            1,
        )
        .unwrap();
    desired
        .set_count(
            ComputeId::new("cn1"),
            "medusa",
            ConfigKey::Image { image: ImageId::new("img-m") },
            3,
        )
        .unwrap();
    desired
        .set_count(
            ComputeId::new("cn2"),
            "storage",
            ConfigKey::Image { image: ImageId::new("img-s") },
            1,
        )
        .unwrap();

    let snap = snapshot_of(&instances).await;
    let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();
    assert!(!ops.is_empty());

    let mut next_id = 0;
    simulate(&mut instances, &ops, &mut next_id);

    // The simulated fleet matches the desired layout slot for slot.
    let counts = observed_counts(&instances);
    for (compute, service, config, want) in desired.iter() {
        let key = (
            compute.to_string(),
            service.to_string(),
            config.shard(),
            config.image().to_string(),
        );
        assert_eq!(
            counts.get(&key).copied().unwrap_or(0),
            want,
            "slot {:?}",
            key
        );
    }
    let desired_total: usize = desired.iter().map(|(_, _, _, n)| n).sum();
    assert_eq!(instances.len(), desired_total);

    // Re-planning from the converged state is a no-op.
    let snap = snapshot_of(&instances).await;
    let ops = plan(&snap, &desired, &PlanOptions::default()).unwrap();
    assert!(ops.is_empty(), "expected convergence, got {:?}", ops);
}

#[tokio::test]
async fn no_reprovision_plans_also_converge() {
    let mut instances = vec![
        sim("i-me-1", "medusa", "cn1", None, "img-a"),
        sim("i-me-2", "medusa", "cn1", None, "img-a"),
    ];
    let mut desired = DesiredLayout::new();
    desired
        .set_count(
            ComputeId::new("cn1"),
            "medusa",
            ConfigKey::Image { image: ImageId::new("img-b") },
            2,
        )
        .unwrap();

    let snap = snapshot_of(&instances).await;
    let opts = PlanOptions {
        allow_reprovision: false,
        ..Default::default()
    };
    let ops = plan(&snap, &desired, &opts).unwrap();
    assert_eq!(ops.len(), 4);

    let mut next_id = 0;
    simulate(&mut instances, &ops, &mut next_id);
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.image == "img-b"));

    let snap = snapshot_of(&instances).await;
    assert!(plan(&snap, &desired, &opts).unwrap().is_empty());
}
