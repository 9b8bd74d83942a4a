use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shoal_domain::{catalog, ComputeId, ConfigKey, ImageId, ServiceName};
use shoal_inventory::FleetSnapshot;
use tracing::debug;

use crate::error::LayoutError;
use crate::layout::DesiredLayout;

// ── Raw file shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawHardware {
    /// Number of metadata shards to lay out.
    #[serde(default = "default_shards")]
    shards: u32,
    azs: Vec<RawAz>,
}

fn default_shards() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct RawAz {
    name: String,
    racks: Vec<RawRack>,
}

#[derive(Debug, Deserialize)]
struct RawRack {
    name: String,
    servers: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    compute_id: String,
    role: String,
}

// ── Validated shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerRole {
    Metadata,
    Storage,
}

#[derive(Debug, Clone)]
struct Server {
    compute_id: ComputeId,
    role: ServerRole,
}

#[derive(Debug, Clone)]
struct AvailabilityZone {
    name: String,
    /// Servers in rack order, then file order within the rack. This order
    /// drives the round-robin assignment, so it must be stable.
    servers: Vec<Server>,
}

/// A validated hardware description: availability zones → racks → servers
/// with roles.
#[derive(Debug, Clone)]
pub struct HardwareConfig {
    shards: u32,
    azs: Vec<AvailabilityZone>,
}

/// Read and validate an operator-authored hardware description.
pub fn read_hardware_config(path: &Path) -> Result<HardwareConfig, LayoutError> {
    let text = std::fs::read_to_string(path).map_err(|e| LayoutError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawHardware = serde_yaml::from_str(&text).map_err(|e| LayoutError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;

    let display = path.display().to_string();
    if raw.azs.is_empty() {
        return Err(LayoutError::Invalid {
            path: display,
            message: "hardware description declares no availability zones".to_string(),
        });
    }
    if raw.shards == 0 {
        return Err(LayoutError::Invalid {
            path: display,
            message: "shards must be at least 1".to_string(),
        });
    }

    let mut azs = Vec::with_capacity(raw.azs.len());
    for az in raw.azs {
        let mut servers = Vec::new();
        for rack in &az.racks {
            for server in &rack.servers {
                let role = match server.role.as_str() {
                    "metadata" => ServerRole::Metadata,
                    "storage" => ServerRole::Storage,
                    other => {
                        return Err(LayoutError::Invalid {
                            path: display,
                            message: format!(
                                "az {} rack {}: unknown server role '{}'",
                                az.name, rack.name, other
                            ),
                        })
                    }
                };
                servers.push(Server {
                    compute_id: ComputeId::new(&server.compute_id),
                    role,
                });
            }
        }
        azs.push(AvailabilityZone {
            name: az.name,
            servers,
        });
    }

    Ok(HardwareConfig {
        shards: raw.shards,
        azs,
    })
}

// ── Generation ───────────────────────────────────────────────────────────────

/// Replicas required for each control-plane service. Sharded entries apply
/// per shard. Count 0 means one instance per metadata server.
const PER_AZ_PLAN: &[(&str, usize)] = &[
    ("nameservice", 3),
    ("postgres", 3),
    ("moray", 3),
    ("electric-moray", 0),
    ("authcache", 2),
    ("medusa", 0),
    ("loadbalancer", 0),
    ("ops", 1),
    ("madtom", 1),
];

#[derive(Debug)]
pub struct GeneratedLayouts {
    pub per_az: BTreeMap<String, DesiredLayout>,
    /// Accumulated problems. Any entry makes the generation a user-visible
    /// error, but the layouts are still produced for inspection.
    pub issues: Vec<String>,
}

impl GeneratedLayouts {
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    /// Write one layout file per availability zone into `dir`, named
    /// `layout-<az>.json`. Returns the written paths.
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>, LayoutError> {
        let mut written = Vec::with_capacity(self.per_az.len());
        for (az, layout) in &self.per_az {
            let path = dir.join(format!("layout-{}.json", az));
            layout.write(&path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// When the description has exactly one AZ the layout may be emitted
    /// directly instead of written to files.
    pub fn single(&self) -> Option<&DesiredLayout> {
        if self.per_az.len() == 1 {
            self.per_az.values().next()
        } else {
            None
        }
    }
}

/// Produce one desired layout per availability zone from the hardware
/// description, drawing images from the snapshot.
pub fn generate_from_hardware(
    config: &HardwareConfig,
    snapshot: &FleetSnapshot,
) -> Result<GeneratedLayouts, LayoutError> {
    let mut per_az = BTreeMap::new();
    let mut issues = Vec::new();

    for az in &config.azs {
        let metadata: Vec<&Server> = az
            .servers
            .iter()
            .filter(|s| s.role == ServerRole::Metadata)
            .collect();
        let storage: Vec<&Server> = az
            .servers
            .iter()
            .filter(|s| s.role == ServerRole::Storage)
            .collect();
        debug!(
            az = %az.name,
            metadata = metadata.len(),
            storage = storage.len(),
            "laying out availability zone"
        );

        if metadata.is_empty() {
            issues.push(format!("az {}: no metadata servers", az.name));
        }
        if storage.is_empty() {
            issues.push(format!("az {}: no storage servers", az.name));
        }

        let mut layout = DesiredLayout::new();
        let mut rr = RoundRobin::new(metadata.len());

        for (service, replicas) in PER_AZ_PLAN {
            let Some(image) = snapshot
                .latest_images
                .get(&ServiceName::new_unchecked(*service))
                .cloned()
            else {
                issues.push(format!("az {}: no image for service {}", az.name, service));
                continue;
            };
            if metadata.is_empty() {
                continue;
            }

            let sharded = catalog::is_sharded(service)?;
            let shard_range: Vec<Option<u32>> = if sharded {
                (1..=config.shards).map(Some).collect()
            } else {
                vec![None]
            };

            for shard in shard_range {
                let want = if *replicas == 0 { metadata.len() } else { *replicas };
                if *replicas > metadata.len() {
                    issues.push(format!(
                        "az {}: service {}{} needs {} distinct metadata servers, have {}",
                        az.name,
                        service,
                        shard.map(|s| format!(" shard {}", s)).unwrap_or_default(),
                        replicas,
                        metadata.len()
                    ));
                }
                for _ in 0..want {
                    let server = metadata[rr.next()];
                    let config_key = match shard {
                        Some(shard) => ConfigKey::ShardImage {
                            shard,
                            image: image.clone(),
                        },
                        None => ConfigKey::Image {
                            image: image.clone(),
                        },
                    };
                    let current =
                        layout.count(&server.compute_id, service, &config_key);
                    layout.set_count(
                        server.compute_id.clone(),
                        service,
                        config_key,
                        current + 1,
                    )?;
                }
            }
        }

        // One storage instance per storage server.
        match snapshot
            .latest_images
            .get(&ServiceName::new_unchecked(catalog::STORAGE))
        {
            Some(image) => {
                for server in &storage {
                    layout.set_count(
                        server.compute_id.clone(),
                        catalog::STORAGE,
                        ConfigKey::Image {
                            image: image.clone(),
                        },
                        1,
                    )?;
                }
            }
            None if !storage.is_empty() => {
                issues.push(format!("az {}: no image for service storage", az.name));
            }
            None => {}
        }

        per_az.insert(az.name.clone(), layout);
    }

    Ok(GeneratedLayouts { per_az, issues })
}

/// Deterministic round-robin index over a fixed-size server list.
struct RoundRobin {
    len: usize,
    next: usize,
}

impl RoundRobin {
    fn new(len: usize) -> Self {
        Self { len, next: 0 }
    }

    fn next(&mut self) -> usize {
        let i = self.next;
        self.next = (self.next + 1) % self.len.max(1);
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_inventory::{load_snapshot, LoaderOptions, MemoryInventory};

    const HW: &str = r#"
shards: 2
azs:
  - name: east-1a
    racks:
      - name: r01
        servers:
          - compute_id: cn1
            role: metadata
          - compute_id: cn2
            role: metadata
          - compute_id: cn3
            role: metadata
      - name: r02
        servers:
          - compute_id: cn4
            role: storage
          - compute_id: cn5
            role: storage
"#;

    async fn full_snapshot() -> FleetSnapshot {
        let mut builder = MemoryInventory::builder();
        for svc in catalog::all() {
            builder = builder.service(svc).image(&format!("img-{}", svc), svc, "2.0.0");
        }
        load_snapshot(&builder.build(), &LoaderOptions::default())
            .await
            .unwrap()
    }

    fn write_hw(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("hardware.yml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn generates_a_clean_layout_for_adequate_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_hardware_config(&write_hw(dir.path(), HW)).unwrap();
        let snap = full_snapshot().await;

        let generated = generate_from_hardware(&config, &snap).unwrap();
        assert_eq!(generated.issue_count(), 0, "issues: {:?}", generated.issues);

        let layout = generated.single().unwrap();
        // Two shards of postgres, three replicas each, spread over cn1-cn3.
        let total: usize = (1..=2)
            .map(|shard| {
                ["cn1", "cn2", "cn3"]
                    .iter()
                    .map(|cn| {
                        layout.count(
                            &ComputeId::new(*cn),
                            "postgres",
                            &ConfigKey::ShardImage {
                                shard,
                                image: ImageId::new("img-postgres"),
                            },
                        )
                    })
                    .sum::<usize>()
            })
            .sum();
        assert_eq!(total, 6);
        // One storage instance per storage server.
        assert_eq!(
            layout.count(
                &ComputeId::new("cn4"),
                "storage",
                &ConfigKey::Image { image: ImageId::new("img-storage") }
            ),
            1
        );
    }

    #[tokio::test]
    async fn insufficient_metadata_servers_accumulate_issues() {
        let dir = tempfile::tempdir().unwrap();
        let hw = r#"
shards: 1
azs:
  - name: east-1a
    racks:
      - name: r01
        servers:
          - compute_id: cn1
            role: metadata
          - compute_id: cn2
            role: storage
"#;
        let config = read_hardware_config(&write_hw(dir.path(), hw)).unwrap();
        let snap = full_snapshot().await;

        let generated = generate_from_hardware(&config, &snap).unwrap();
        // nameservice, postgres, and moray each want 3 distinct servers.
        assert!(generated.issue_count() >= 3, "issues: {:?}", generated.issues);
    }

    #[tokio::test]
    async fn write_all_emits_one_file_per_az() {
        let dir = tempfile::tempdir().unwrap();
        let two_az = HW.replace(
            "  - name: east-1a",
            "  - name: east-1b\n    racks: []\n  - name: east-1a",
        );
        let config = read_hardware_config(&write_hw(dir.path(), &two_az)).unwrap();
        let snap = full_snapshot().await;

        let generated = generate_from_hardware(&config, &snap).unwrap();
        let out = tempfile::tempdir().unwrap();
        let written = generated.write_all(out.path()).unwrap();
        assert_eq!(written.len(), 2);
        for path in written {
            assert!(DesiredLayout::read(&path).is_ok());
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hw = HW.replace("role: storage", "role: compute");
        let err = read_hardware_config(&write_hw(dir.path(), &hw)).unwrap_err();
        assert!(matches!(err, LayoutError::Invalid { .. }));
    }
}
