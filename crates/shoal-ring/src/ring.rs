use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoal_domain::{catalog, Instance, InstanceId};
use shoal_inventory::{Application, FleetSnapshot, InventoryApi};
use tracing::{debug, info};

use crate::error::RingError;

/// Instance-metadata key carrying the member's ring ordinal.
pub const ORDINAL_KEY: &str = "zk_id";

#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Application-metadata property holding the ring.
    pub property: String,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            property: "ZK_SERVERS".to_string(),
        }
    }
}

/// One member of the stored coordination ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingEntry {
    #[serde(rename = "num")]
    pub ordinal: u32,
    #[serde(rename = "host")]
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub last: bool,
}

/// Structural problems the reconciler never repairs automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingProblem {
    NonPositiveOrdinal { index: usize },
    DuplicateOrdinal { ordinal: u32 },
    MisplacedLast { index: usize },
    MissingLast,
    AddressMismatch {
        ordinal: u32,
        entry_address: String,
        instance_address: String,
    },
    DuplicateMetadataOrdinal { ordinal: u32, instance: InstanceId },
    NoMetadataOrdinal { instance: InstanceId },
    BadMetadataOrdinal { instance: InstanceId, value: String },
}

impl std::fmt::Display for RingProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingProblem::NonPositiveOrdinal { index } => {
                write!(f, "entry {}: ordinal must be positive", index)
            }
            RingProblem::DuplicateOrdinal { ordinal } => {
                write!(f, "duplicate ordinal {}", ordinal)
            }
            RingProblem::MisplacedLast { index } => {
                write!(f, "entry {}: \"last\" set on a non-final entry", index)
            }
            RingProblem::MissingLast => write!(f, "final entry does not carry \"last\""),
            RingProblem::AddressMismatch {
                ordinal,
                entry_address,
                instance_address,
            } => write!(
                f,
                "ordinal {}: ring address {} != instance address {}",
                ordinal, entry_address, instance_address
            ),
            RingProblem::DuplicateMetadataOrdinal { ordinal, instance } => write!(
                f,
                "instance {}: ordinal {} already claimed by another instance",
                instance, ordinal
            ),
            RingProblem::NoMetadataOrdinal { instance } => {
                write!(f, "instance {}: no {} metadata", instance, ORDINAL_KEY)
            }
            RingProblem::BadMetadataOrdinal { instance, value } => {
                write!(f, "instance {}: unparsable {} '{}'", instance, ORDINAL_KEY, value)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RingAudit {
    pub entries: Vec<RingEntry>,
    /// Indices into `entries` whose ordinal has no backing instance.
    /// Automatically repairable.
    pub missing_instances: Vec<usize>,
    pub validation_errors: Vec<RingProblem>,
    /// Entries backed by an instance in another datacenter. Informational.
    pub foreign_count: usize,
}

impl RingAudit {
    pub fn is_clean(&self) -> bool {
        self.missing_instances.is_empty() && self.validation_errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RingRepair {
    /// Ordinals removed from the ring.
    pub removed: Vec<u32>,
    /// The ring as stored after repair (or as it would be, when dry).
    pub entries: Vec<RingEntry>,
    /// Whether the metadata property was rewritten.
    pub wrote: bool,
}

// ── Audit ────────────────────────────────────────────────────────────────────

fn parse_entries(app: &Application, property: &str) -> Result<Vec<RingEntry>, RingError> {
    let value = app
        .metadata
        .get(property)
        .ok_or_else(|| RingError::PropertyMissing(property.to_string()))?;
    serde_json::from_value(value.clone()).map_err(|e| RingError::BadProperty(e.to_string()))
}

/// Audit the stored ring against the observed nameservice instances.
pub fn audit(snapshot: &FleetSnapshot, config: &RingConfig) -> Result<RingAudit, RingError> {
    let entries = parse_entries(&snapshot.application, &config.property)?;
    Ok(audit_entries(entries, snapshot))
}

fn audit_entries(entries: Vec<RingEntry>, snapshot: &FleetSnapshot) -> RingAudit {
    let mut validation_errors = Vec::new();

    // Structural checks on the stored array.
    let mut seen = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.ordinal == 0 {
            validation_errors.push(RingProblem::NonPositiveOrdinal { index });
        }
        if let Some(_previous) = seen.insert(entry.ordinal, index) {
            validation_errors.push(RingProblem::DuplicateOrdinal {
                ordinal: entry.ordinal,
            });
        }
        if entry.last && index != entries.len() - 1 {
            validation_errors.push(RingProblem::MisplacedLast { index });
        }
    }
    if entries.last().is_some_and(|e| !e.last) {
        validation_errors.push(RingProblem::MissingLast);
    }

    // Ordinal → instance map from nameservice metadata.
    let mut by_ordinal: HashMap<u32, &Instance> = HashMap::new();
    for inst in snapshot.instances_of(catalog::NAMESERVICE) {
        let Some(raw) = inst.metadata.get(ORDINAL_KEY) else {
            validation_errors.push(RingProblem::NoMetadataOrdinal {
                instance: inst.instance_id.clone(),
            });
            continue;
        };
        let Ok(ordinal) = raw.parse::<u32>() else {
            validation_errors.push(RingProblem::BadMetadataOrdinal {
                instance: inst.instance_id.clone(),
                value: raw.clone(),
            });
            continue;
        };
        if by_ordinal.insert(ordinal, inst).is_some() {
            validation_errors.push(RingProblem::DuplicateMetadataOrdinal {
                ordinal,
                instance: inst.instance_id.clone(),
            });
        }
    }

    let mut missing_instances = Vec::new();
    let mut foreign_count = 0;
    for (index, entry) in entries.iter().enumerate() {
        match by_ordinal.get(&entry.ordinal) {
            Some(inst) if inst.is_local() => {
                let address = inst.primary_address.as_deref().unwrap_or("-");
                if address != entry.address {
                    validation_errors.push(RingProblem::AddressMismatch {
                        ordinal: entry.ordinal,
                        entry_address: entry.address.clone(),
                        instance_address: address.to_string(),
                    });
                }
            }
            Some(_) => foreign_count += 1,
            None => missing_instances.push(index),
        }
    }

    debug!(
        entries = entries.len(),
        missing = missing_instances.len(),
        problems = validation_errors.len(),
        foreign = foreign_count,
        "ring audit complete"
    );
    RingAudit {
        entries,
        missing_instances,
        validation_errors,
        foreign_count,
    }
}

// ── Repair ───────────────────────────────────────────────────────────────────

/// Remove ring entries whose ordinal has no backing instance and rewrite the
/// stored property.
///
/// Refuses when the audit reports validation errors; those need an operator.
/// Re-reads the property immediately before writing, but concurrent callers
/// must still be serialized externally. Idempotent: a clean ring is left
/// untouched.
pub async fn repair(
    api: &dyn InventoryApi,
    snapshot: &FleetSnapshot,
    config: &RingConfig,
    dry_run: bool,
) -> Result<RingRepair, RingError> {
    // Fresh read so a repair never writes back a stale ring.
    let app = api
        .get_application(&snapshot.application.name)
        .await?
        .ok_or_else(|| {
            RingError::BadProperty(format!(
                "application {} vanished upstream",
                snapshot.application.name
            ))
        })?;
    let entries = parse_entries(&app, &config.property)?;
    let audit = audit_entries(entries, snapshot);

    if !audit.validation_errors.is_empty() {
        return Err(RingError::Unrepairable(audit.validation_errors.len()));
    }
    if audit.missing_instances.is_empty() {
        return Ok(RingRepair {
            removed: Vec::new(),
            entries: audit.entries,
            wrote: false,
        });
    }

    let mut entries = audit.entries;
    let mut removed = Vec::new();
    // Descending index order preserves the meaning of the remaining indices.
    for &index in audit.missing_instances.iter().rev() {
        removed.push(entries.remove(index).ordinal);
    }
    removed.reverse();

    for entry in entries.iter_mut() {
        entry.last = false;
    }
    if let Some(tail) = entries.last_mut() {
        tail.last = true;
    }

    info!(removed = removed.len(), remaining = entries.len(), "repairing ring");
    if !dry_run {
        let value = serde_json::to_value(&entries)
            .map_err(|e| RingError::BadProperty(e.to_string()))?;
        api.update_app_metadata(&app.uuid, &config.property, value)
            .await?;
    }

    Ok(RingRepair {
        removed,
        entries,
        wrote: !dry_run,
    })
}
