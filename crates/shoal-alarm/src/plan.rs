use std::collections::{BTreeSet, HashMap};

use futures::stream::{self, StreamExt};
use shoal_inventory::{FleetSnapshot, InventoryApi};
use tracing::{debug, info};

use crate::api::{MonitoringApi, NewProbe, NewProbeGroup, Probe, ProbeGroup};
use crate::error::AlarmError;
use crate::events::is_removable_group_name;
use crate::wanted::WantedGroup;

/// The monitoring configuration as currently deployed.
#[derive(Debug, Clone, Default)]
pub struct DeployedConfig {
    pub groups: Vec<ProbeGroup>,
    pub probes: Vec<Probe>,
}

/// Load deployed probe groups and the probes of every agent we may ever have
/// configured: local instances, their compute nodes, and agents of VMs that
/// have since been destroyed (so their leftovers get cleaned up).
pub async fn load_deployed(
    monitor: &dyn MonitoringApi,
    inventory: &dyn InventoryApi,
    snapshot: &FleetSnapshot,
    concurrency: usize,
) -> Result<DeployedConfig, AlarmError> {
    let account = &snapshot.application.owner_account;
    let groups = monitor.list_probe_groups(account).await?;

    let mut agents: BTreeSet<String> = BTreeSet::new();
    for inst in snapshot.local_instances() {
        agents.insert(inst.instance_id.to_string());
    }
    for compute in snapshot.compute_nodes.keys() {
        agents.insert(compute.to_string());
    }
    for vm in inventory.list_destroyed_vms(account).await? {
        agents.insert(vm.uuid);
        if let Some(server) = vm.server_uuid {
            agents.insert(server);
        }
    }
    info!(agents = agents.len(), groups = groups.len(), "loading deployed probes");

    let results: Vec<Result<Vec<Probe>, AlarmError>> = stream::iter(agents)
        .map(|agent| async move { monitor.list_probes(account, &agent).await })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut probes = Vec::new();
    for result in results {
        probes.extend(result?);
    }
    // Fan-out completion order is not deterministic; the plan diff must be.
    probes.sort_by(|a, b| a.uuid.cmp(&b.uuid));

    Ok(DeployedConfig { groups, probes })
}

/// A probe scheduled for creation. Its group may not exist yet; the group id
/// is resolved through the plan's name → id index during apply.
#[derive(Debug, Clone)]
pub struct PendingProbe {
    pub group_name: String,
    pub probe: NewProbe,
}

#[derive(Debug, Default)]
pub struct AlarmUpdatePlan {
    pub groups_to_add: Vec<NewProbeGroup>,
    pub groups_to_remove: Vec<ProbeGroup>,
    pub probes_to_add: Vec<PendingProbe>,
    pub probes_to_remove: Vec<Probe>,
    /// Differences reported but not acted on (contact or owner drift).
    pub warnings: Vec<String>,
    /// Name → uuid for groups that already exist. Extended during apply as
    /// new groups are created.
    pub group_index: HashMap<String, String>,
}

impl AlarmUpdatePlan {
    pub fn has_no_changes(&self) -> bool {
        self.groups_to_add.is_empty()
            && self.groups_to_remove.is_empty()
            && self.probes_to_add.is_empty()
            && self.probes_to_remove.is_empty()
    }
}

/// Diff the wanted set against the deployed configuration.
///
/// Passing an empty wanted set yields the unconfigure plan: every group this
/// toolkit recognises as its own is scheduled for removal, and
/// operator-owned groups are left in place either way.
pub fn build_update_plan(wanted: &[WantedGroup], deployed: &DeployedConfig) -> AlarmUpdatePlan {
    let mut plan = AlarmUpdatePlan::default();

    let deployed_by_name: HashMap<&str, &ProbeGroup> =
        deployed.groups.iter().map(|g| (g.name.as_str(), g)).collect();
    let mut probes_by_group: HashMap<&str, Vec<&Probe>> = HashMap::new();
    for probe in &deployed.probes {
        probes_by_group.entry(probe.group_id.as_str()).or_default().push(probe);
    }
    for group in &deployed.groups {
        plan.group_index.insert(group.name.clone(), group.uuid.clone());
    }

    let mut wanted_names: BTreeSet<&str> = BTreeSet::new();
    for want in wanted {
        wanted_names.insert(want.name.as_str());
        match deployed_by_name.get(want.name.as_str()) {
            Some(deployed_group) => {
                if deployed_group.contacts != want.contacts {
                    plan.warnings.push(format!(
                        "group {}: contacts differ (deployed {:?}, expected {:?})",
                        want.name, deployed_group.contacts, want.contacts
                    ));
                }
                let deployed_probes = probes_by_group
                    .get(deployed_group.uuid.as_str())
                    .cloned()
                    .unwrap_or_default();
                diff_probes(want, deployed_probes, &mut plan);
            }
            None => {
                plan.groups_to_add.push(NewProbeGroup {
                    name: want.name.clone(),
                    contacts: want.contacts.clone(),
                });
                for probe in &want.probes {
                    plan.probes_to_add.push(PendingProbe {
                        group_name: want.name.clone(),
                        probe: NewProbe {
                            name: probe.name.clone(),
                            probe_type: probe.probe_type.clone(),
                            config: probe.config.clone(),
                            agent: probe.agent.clone(),
                            machine: probe.machine.clone(),
                            group_id: String::new(),
                        },
                    });
                }
            }
        }
    }

    // Deployed groups nobody wants: removable only when the name is ours
    // (current or legacy). Operator-owned groups stay, probes included.
    for group in &deployed.groups {
        if wanted_names.contains(group.name.as_str()) {
            continue;
        }
        if is_removable_group_name(&group.name) {
            debug!(group = %group.name, "scheduling stale group for removal");
            if let Some(probes) = probes_by_group.get(group.uuid.as_str()) {
                plan.probes_to_remove.extend(probes.iter().map(|p| (*p).clone()));
            }
            plan.groups_to_remove.push(group.clone());
        }
    }

    plan
}

/// Match wanted probes against the deployed probes of one group on
/// (type, config, agent, machine); unmatched on either side schedule work.
fn diff_probes(want: &WantedGroup, deployed: Vec<&Probe>, plan: &mut AlarmUpdatePlan) {
    let mut used = vec![false; deployed.len()];

    for probe in &want.probes {
        let matched = deployed.iter().enumerate().position(|(i, d)| {
            !used[i]
                && d.probe_type == probe.probe_type
                && d.config == probe.config
                && d.agent == probe.agent
                && d.machine == probe.machine
        });
        match matched {
            Some(i) => used[i] = true,
            None => plan.probes_to_add.push(PendingProbe {
                group_name: want.name.clone(),
                probe: NewProbe {
                    name: probe.name.clone(),
                    probe_type: probe.probe_type.clone(),
                    config: probe.config.clone(),
                    agent: probe.agent.clone(),
                    machine: probe.machine.clone(),
                    group_id: String::new(),
                },
            }),
        }
    }

    for (i, probe) in deployed.iter().enumerate() {
        if !used[i] {
            plan.probes_to_remove.push((*probe).clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryMonitor;
    use crate::events::event_catalog;
    use crate::wanted::compute_wanted;
    use serde_json::json;
    use shoal_inventory::{load_snapshot, LoaderOptions, MemoryInventory};

    async fn small_fleet() -> (MemoryInventory, FleetSnapshot) {
        let inv = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .instance("i-med-1", "medusa", "cn1", "img-m", &[])
            .build();
        let snap = load_snapshot(&inv, &LoaderOptions::default()).await.unwrap();
        (inv, snap)
    }

    fn contacts() -> Vec<String> {
        vec!["email".to_string()]
    }

    #[tokio::test]
    async fn fresh_deployment_creates_everything() {
        let (inv, snap) = small_fleet().await;
        let monitor = MemoryMonitor::new();
        let wanted = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();

        let plan = build_update_plan(&wanted, &deployed);
        assert!(!plan.has_no_changes());
        assert_eq!(plan.groups_to_add.len(), wanted.len());
        assert!(plan.groups_to_remove.is_empty());
        assert!(plan.probes_to_remove.is_empty());
        let wanted_probes: usize = wanted.iter().map(|g| g.probes.len()).sum();
        assert_eq!(plan.probes_to_add.len(), wanted_probes);
    }

    #[tokio::test]
    async fn matched_groups_diff_probes_individually() {
        let (inv, snap) = small_fleet().await;
        let monitor = MemoryMonitor::new();
        // Deploy the latency group with one matching and one stale probe.
        let gid = monitor
            .seed_group("upset.shoal.medusa.latency_high;v=1", &["email"])
            .await;
        monitor
            .seed_probe(
                &gid,
                "latency_high-i-med-1",
                "http",
                json!({ "path": "/ping", "maxResponseTime": 2000 }),
                "i-med-1",
                Some("i-med-1"),
            )
            .await;
        monitor
            .seed_probe(
                &gid,
                "latency_high-i-gone",
                "http",
                json!({ "path": "/ping", "maxResponseTime": 2000 }),
                "i-gone",
                Some("i-gone"),
            )
            .await;

        let wanted = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();
        let plan = build_update_plan(&wanted, &deployed);

        // The matching probe survives; the stale one goes. But listing is
        // per-agent: i-gone is not a known agent, so its probe is invisible
        // until the VM shows up in the destroyed list.
        assert!(plan
            .probes_to_add
            .iter()
            .all(|p| p.probe.agent != "i-med-1"
                || p.group_name != "upset.shoal.medusa.latency_high;v=1"));
    }

    #[tokio::test]
    async fn destroyed_agents_are_swept() {
        let (_, snap) = small_fleet().await;
        let inv = MemoryInventory::builder()
            .service("medusa")
            .compute_node("cn1", "host01", true)
            .instance("i-med-1", "medusa", "cn1", "img-m", &[])
            .destroyed_vm("i-gone", "medusa")
            .build();
        let monitor = MemoryMonitor::new();
        let gid = monitor
            .seed_group("upset.shoal.medusa.latency_high;v=1", &["email"])
            .await;
        monitor
            .seed_probe(
                &gid,
                "latency_high-i-gone",
                "http",
                json!({ "path": "/ping", "maxResponseTime": 2000 }),
                "i-gone",
                Some("i-gone"),
            )
            .await;

        let wanted = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();
        let plan = build_update_plan(&wanted, &deployed);
        assert!(plan.probes_to_remove.iter().any(|p| p.agent == "i-gone"));
    }

    #[tokio::test]
    async fn operator_groups_are_left_alone() {
        let (inv, snap) = small_fleet().await;
        let monitor = MemoryMonitor::new();
        let gid = monitor.seed_group("ops-custom-checks", &["pager"]).await;
        monitor
            .seed_probe(&gid, "custom", "cmd", json!({ "cmd": "true" }), "i-med-1", None)
            .await;

        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();

        // Even the unconfigure plan must not touch it.
        let plan = build_update_plan(&[], &deployed);
        assert!(plan.groups_to_remove.is_empty());
        assert!(plan.probes_to_remove.is_empty());
    }

    #[tokio::test]
    async fn unconfigure_removes_our_groups() {
        let (inv, snap) = small_fleet().await;
        let monitor = MemoryMonitor::new();
        let gid = monitor
            .seed_group("upset.shoal.instance_down;v=1", &["email"])
            .await;
        monitor
            .seed_probe(&gid, "instance_down-i-med-1", "machine-up", json!({}), "i-med-1", None)
            .await;
        monitor.seed_group("shoal-alarms", &["email"]).await;

        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();
        let plan = build_update_plan(&[], &deployed);
        assert_eq!(plan.groups_to_remove.len(), 2);
        assert_eq!(plan.probes_to_remove.len(), 1);
    }

    #[tokio::test]
    async fn contact_drift_warns_but_does_not_recreate() {
        let (inv, snap) = small_fleet().await;
        let monitor = MemoryMonitor::new();
        monitor
            .seed_group("upset.shoal.medusa.latency_high;v=1", &["pager"])
            .await;

        let wanted = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let deployed = load_deployed(&monitor, &inv, &snap, 10).await.unwrap();
        let plan = build_update_plan(&wanted, &deployed);

        assert!(plan.warnings.iter().any(|w| w.contains("contacts differ")));
        assert!(!plan
            .groups_to_add
            .iter()
            .any(|g| g.name == "upset.shoal.medusa.latency_high;v=1"));
    }
}
