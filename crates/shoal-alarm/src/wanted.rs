use std::collections::BTreeSet;

use serde_json::{Map, Value};
use shoal_domain::{catalog, Instance};
use shoal_inventory::FleetSnapshot;
use tracing::debug;

use crate::error::AlarmError;
use crate::events::{
    group_name, service_alias, CheckTemplate, EventScope, EventTemplate, SERVICE_PLACEHOLDER,
};

/// A probe we want deployed. Identity for matching against deployed probes
/// is (type, config, agent, machine).
#[derive(Debug, Clone, PartialEq)]
pub struct WantedProbe {
    pub name: String,
    pub probe_type: String,
    pub config: Value,
    pub agent: String,
    pub machine: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WantedGroup {
    pub name: String,
    pub event_class: String,
    pub contacts: Vec<String>,
    pub probes: Vec<WantedProbe>,
}

/// Expand the event templates over the fleet snapshot into the full wanted
/// set of probe groups and probes.
pub fn compute_wanted(
    snapshot: &FleetSnapshot,
    templates: &[EventTemplate],
    contacts: &[String],
) -> Result<Vec<WantedGroup>, AlarmError> {
    let mut groups = Vec::new();

    for template in templates {
        match &template.scope {
            EventScope::Service { service, global } => {
                let probes = if *global {
                    compute_node_probes(snapshot, service, template)?
                } else {
                    instance_probes(snapshot, service, template)?
                };
                groups.push(WantedGroup {
                    name: group_name(template.event_class),
                    event_class: template.event_class.to_string(),
                    contacts: contacts.to_vec(),
                    probes,
                });
            }
            EventScope::Each => {
                for service in catalog::probe_targets() {
                    let event_class = template
                        .event_class
                        .replace(SERVICE_PLACEHOLDER, &service_alias(service));
                    groups.push(WantedGroup {
                        name: group_name(&event_class),
                        event_class,
                        contacts: contacts.to_vec(),
                        probes: instance_probes(snapshot, service, template)?,
                    });
                }
            }
            EventScope::All => {
                let mut probes = Vec::new();
                for service in catalog::probe_targets() {
                    probes.extend(instance_probes(snapshot, service, template)?);
                }
                groups.push(WantedGroup {
                    name: group_name(template.event_class),
                    event_class: template.event_class.to_string(),
                    contacts: contacts.to_vec(),
                    probes,
                });
            }
            EventScope::CheckFrom { target, checker } => {
                let mut probes = Vec::new();
                for target_inst in snapshot.instances_of(target).filter(|i| i.is_local()) {
                    for checker_inst in snapshot.instances_of(checker).filter(|i| i.is_local()) {
                        for check in &template.checks {
                            let mut config = check.config.clone();
                            if let (Some(obj), Some(address)) =
                                (config.as_object_mut(), &target_inst.primary_address)
                            {
                                obj.insert("host".to_string(), Value::from(address.clone()));
                            }
                            probes.push(WantedProbe {
                                name: probe_name(
                                    template.event_class,
                                    checker_inst.instance_id.as_str(),
                                ),
                                probe_type: check.check_type.to_string(),
                                config,
                                agent: checker_inst.instance_id.to_string(),
                                machine: Some(target_inst.instance_id.to_string()),
                            });
                        }
                    }
                }
                groups.push(WantedGroup {
                    name: group_name(template.event_class),
                    event_class: template.event_class.to_string(),
                    contacts: contacts.to_vec(),
                    probes,
                });
            }
        }
    }

    debug!(
        groups = groups.len(),
        probes = groups.iter().map(|g| g.probes.len()).sum::<usize>(),
        "wanted set computed"
    );
    Ok(groups)
}

/// One probe per check per local instance of the service.
fn instance_probes(
    snapshot: &FleetSnapshot,
    service: &str,
    template: &EventTemplate,
) -> Result<Vec<WantedProbe>, AlarmError> {
    let mut probes = Vec::new();
    for inst in snapshot.instances_of(service).filter(|i| i.is_local()) {
        for check in &template.checks {
            probes.push(WantedProbe {
                name: probe_name(template.event_class, inst.instance_id.as_str()),
                probe_type: check.check_type.to_string(),
                config: check_config(check, inst)?,
                agent: inst.instance_id.to_string(),
                machine: Some(inst.instance_id.to_string()),
            });
        }
    }
    Ok(probes)
}

/// One probe per check per distinct compute node hosting the service.
fn compute_node_probes(
    snapshot: &FleetSnapshot,
    service: &str,
    template: &EventTemplate,
) -> Result<Vec<WantedProbe>, AlarmError> {
    let computes: BTreeSet<_> = snapshot
        .instances_of(service)
        .filter_map(|i| i.host_compute.clone())
        .collect();
    let mut probes = Vec::new();
    for compute in computes {
        for check in &template.checks {
            probes.push(WantedProbe {
                name: probe_name(template.event_class, compute.as_str()),
                probe_type: check.check_type.to_string(),
                config: check.config.clone(),
                agent: compute.to_string(),
                machine: Some(compute.to_string()),
            });
        }
    }
    Ok(probes)
}

/// Copy the check config, populating its environment from instance metadata
/// per the template's auto_env list. A missing key is an input error: the
/// check would run with an incomplete environment.
fn check_config(check: &CheckTemplate, instance: &Instance) -> Result<Value, AlarmError> {
    if check.auto_env.is_empty() {
        return Ok(check.config.clone());
    }
    let mut config = check.config.clone();
    let mut env = Map::new();
    for key in check.auto_env {
        let value = instance.metadata.get(*key).ok_or_else(|| {
            AlarmError::MissingMetadata {
                instance: instance.instance_id.to_string(),
                key: key.to_string(),
            }
        })?;
        env.insert(key.to_string(), Value::from(value.clone()));
    }
    if let Some(obj) = config.as_object_mut() {
        obj.insert("env".to_string(), Value::Object(env));
    }
    Ok(config)
}

fn probe_name(event_class: &str, subject: &str) -> String {
    let tail = event_class.rsplit('.').next().unwrap_or(event_class);
    format!("{}-{}", tail, subject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_catalog;
    use shoal_inventory::{load_snapshot, LoaderOptions, MemoryInventory};

    async fn fleet() -> FleetSnapshot {
        let inv = MemoryInventory::builder()
            .service("postgres")
            .service("moray")
            .service("electric-moray")
            .service("storage")
            .compute_node("cn1", "host01", true)
            .compute_node("cn2", "host02", false)
            .instance("i-pg-1", "postgres", "cn1", "img-pg", &[("shard", "1")])
            .instance("i-moray-1", "moray", "cn1", "img-mo", &[("shard", "1")])
            .instance("i-em-1", "electric-moray", "cn1", "img-em", &[("shard", "1")])
            .instance("i-stor-1", "storage", "cn1", "img-st", &[])
            .instance("i-stor-2", "storage", "cn2", "img-st", &[])
            .instance("i-stor-3", "storage", "cn2", "img-st", &[])
            .build();
        load_snapshot(&inv, &LoaderOptions::default()).await.unwrap()
    }

    fn contacts() -> Vec<String> {
        vec!["email".to_string()]
    }

    fn find<'a>(groups: &'a [WantedGroup], name: &str) -> &'a WantedGroup {
        groups
            .iter()
            .find(|g| g.name == name)
            .unwrap_or_else(|| panic!("no group named {}", name))
    }

    #[tokio::test]
    async fn service_scope_yields_one_probe_per_instance() {
        let snap = fleet().await;
        let groups = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let group = find(&groups, "upset.shoal.postgres.replication_lag;v=1");
        assert_eq!(group.probes.len(), 1);
        let probe = &group.probes[0];
        assert_eq!(probe.agent, "i-pg-1");
        // auto_env copied the shard into the check environment.
        assert_eq!(probe.config["env"]["shard"], "1");
    }

    #[tokio::test]
    async fn global_scope_deduplicates_compute_nodes() {
        let snap = fleet().await;
        let groups = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let group = find(&groups, "upset.shoal.storage.zpool_degraded;v=1");
        // Three storage instances on two compute nodes.
        assert_eq!(group.probes.len(), 2);
        let agents: BTreeSet<&str> = group.probes.iter().map(|p| p.agent.as_str()).collect();
        assert_eq!(agents, BTreeSet::from(["cn1", "cn2"]));
    }

    #[tokio::test]
    async fn each_scope_expands_per_probe_service() {
        let snap = fleet().await;
        let groups = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let group = find(&groups, "upset.shoal.electric_moray.log_error;v=1");
        assert_eq!(group.probes.len(), 1);
        assert_eq!(group.probes[0].agent, "i-em-1");
        // Services with no instances still get their (empty) group.
        let empty = find(&groups, "upset.shoal.medusa.log_error;v=1");
        assert!(empty.probes.is_empty());
    }

    #[tokio::test]
    async fn check_from_crosses_checkers_with_targets() {
        let snap = fleet().await;
        let groups = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let group = find(&groups, "upset.shoal.moray.connect_failed;v=1");
        assert_eq!(group.probes.len(), 1);
        let probe = &group.probes[0];
        assert_eq!(probe.agent, "i-em-1");
        assert_eq!(probe.machine.as_deref(), Some("i-moray-1"));
        assert!(probe.config["host"].is_string());
    }

    #[tokio::test]
    async fn all_scope_covers_every_probe_service_instance() {
        let snap = fleet().await;
        let groups = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap();
        let group = find(&groups, "upset.shoal.instance_down;v=1");
        // All six local instances belong to probe-supporting services.
        assert_eq!(group.probes.len(), 6);
    }

    #[tokio::test]
    async fn missing_auto_env_metadata_is_an_error() {
        let inv = MemoryInventory::builder()
            .service("postgres")
            .compute_node("cn1", "host01", true)
            .instance("i-pg-1", "postgres", "cn1", "img-pg", &[("shard", "1")])
            .build();
        let mut snap = load_snapshot(&inv, &LoaderOptions::default()).await.unwrap();
        // Drop the shard key the template's auto_env requires.
        for inst in snap.instances.iter_mut() {
            inst.metadata.remove("shard");
        }
        let err = compute_wanted(&snap, &event_catalog(), &contacts()).unwrap_err();
        assert!(matches!(err, AlarmError::MissingMetadata { .. }));
    }
}
