use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use shoal_domain::{catalog, ComputeId, InstanceId, ServiceName};
use shoal_inventory::FleetSnapshot;
use tracing::debug;

use crate::error::DispatchError;

/// A scoping predicate: the union of every selector present. Unknown
/// identifiers are input errors; known-but-empty selections legally resolve
/// to zero targets.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub instances: Vec<String>,
    pub services: Vec<String>,
    /// Compute hostnames or compute ids.
    pub computes: Vec<String>,
    pub all_instances: bool,
    /// Target the host operating environment of the selected compute nodes
    /// rather than the instances themselves.
    pub global_zones: bool,
}

impl Scope {
    fn is_empty(&self) -> bool {
        self.instances.is_empty()
            && self.services.is_empty()
            && self.computes.is_empty()
            && !self.all_instances
            && !self.global_zones
    }

    fn is_instance_free(&self) -> bool {
        self.instances.is_empty() && self.services.is_empty() && self.computes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Instance {
        instance_id: InstanceId,
        service: ServiceName,
        compute: ComputeId,
        hostname: String,
        primary_address: Option<String>,
    },
    GlobalZone {
        compute: ComputeId,
        hostname: String,
    },
}

impl Target {
    /// Inventory identifier: the instance uuid, or the compute id for a
    /// global zone.
    pub fn uuid(&self) -> &str {
        match self {
            Target::Instance { instance_id, .. } => instance_id.as_str(),
            Target::GlobalZone { compute, .. } => compute.as_str(),
        }
    }

    pub fn zonename(&self) -> &str {
        match self {
            Target::Instance { instance_id, .. } => instance_id.as_str(),
            Target::GlobalZone { .. } => "global",
        }
    }

    pub fn service_label(&self) -> &str {
        match self {
            Target::Instance { service, .. } => service.as_str(),
            Target::GlobalZone { .. } => "global",
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            Target::Instance { hostname, .. } => hostname,
            Target::GlobalZone { hostname, .. } => hostname,
        }
    }

    pub fn compute(&self) -> &ComputeId {
        match self {
            Target::Instance { compute, .. } => compute,
            Target::GlobalZone { compute, .. } => compute,
        }
    }
}

/// Resolve a scope against the snapshot into the concrete target set, in
/// deterministic (instance-sorted) order.
pub fn resolve_scope(snapshot: &FleetSnapshot, scope: &Scope) -> Result<Vec<Target>, DispatchError> {
    if scope.is_empty() {
        return Err(DispatchError::BadScope(
            "no instances, services, or compute nodes selected".to_string(),
        ));
    }

    // Validate every named identifier up front.
    for service in &scope.services {
        if !catalog::is_valid(service) {
            return Err(DispatchError::BadScope(format!("unknown service '{}'", service)));
        }
        if !catalog::supports_fleet_command(service)? {
            return Err(DispatchError::BadScope(format!(
                "service '{}' does not support fleet commands",
                service
            )));
        }
    }
    let mut selected_computes: BTreeSet<ComputeId> = BTreeSet::new();
    for name in &scope.computes {
        let cn = snapshot
            .compute_node(&ComputeId::new(name))
            .or_else(|| snapshot.compute_node_by_hostname(name))
            .ok_or_else(|| {
                DispatchError::BadScope(format!("unknown compute node '{}'", name))
            })?;
        selected_computes.insert(cn.compute_id.clone());
    }
    for id in &scope.instances {
        let inst = snapshot
            .instance(&InstanceId::new(id))
            .ok_or_else(|| DispatchError::BadScope(format!("unknown instance '{}'", id)))?;
        if !catalog::supports_fleet_command(inst.service.as_str())? {
            return Err(DispatchError::BadScope(format!(
                "instance '{}' belongs to service '{}', which does not support fleet commands",
                id, inst.service
            )));
        }
    }

    // Walk the sorted instance list once; membership in any selector admits
    // the instance.
    let select_all = scope.all_instances || (scope.global_zones && scope.is_instance_free());
    let mut targets = Vec::new();
    let mut seen_computes: BTreeSet<ComputeId> = BTreeSet::new();
    for inst in snapshot.local_instances() {
        if !catalog::supports_fleet_command(inst.service.as_str())? {
            continue;
        }
        let Some(compute) = inst.host_compute.clone() else {
            continue;
        };
        let selected = select_all
            || scope.instances.iter().any(|id| id == inst.instance_id.as_str())
            || scope.services.iter().any(|s| s == inst.service.as_str())
            || selected_computes.contains(&compute);
        if !selected {
            continue;
        }

        let hostname = snapshot
            .compute_node(&compute)
            .map(|cn| cn.hostname.clone())
            .unwrap_or_else(|| "-".to_string());

        if scope.global_zones {
            if seen_computes.insert(compute.clone()) {
                targets.push(Target::GlobalZone { compute, hostname });
            }
        } else {
            targets.push(Target::Instance {
                instance_id: inst.instance_id.clone(),
                service: inst.service.clone(),
                compute,
                hostname,
                primary_address: inst.primary_address.clone(),
            });
        }
    }

    debug!(targets = targets.len(), "scope resolved");
    Ok(targets)
}
