use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use shoal_domain::{catalog, ComputeId, ConfigKey, ImageId, ServiceName};

use crate::error::LayoutError;

/// The desired fleet layout: compute node → service → config key → count.
///
/// The pseudo compute id `<any>` means unpinned placement; a layout may use
/// it for every entry or not at all, never mixed with pinned compute ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredLayout {
    nodes: BTreeMap<ComputeId, BTreeMap<ServiceName, BTreeMap<ConfigKey, usize>>>,
}

impl DesiredLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the desired count for one (compute, service, config) slot,
    /// validating the service name and config-key shape.
    pub fn set_count(
        &mut self,
        compute: ComputeId,
        service: &str,
        config: ConfigKey,
        count: usize,
    ) -> Result<(), LayoutError> {
        config.validate_for(service)?;
        self.nodes
            .entry(compute)
            .or_default()
            .entry(ServiceName::new_unchecked(service))
            .or_default()
            .insert(config, count);
        self.check_any_mixing()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn uses_any(&self) -> bool {
        self.nodes.keys().any(|c| c.is_any())
    }

    pub fn computes(&self) -> impl Iterator<Item = &ComputeId> {
        self.nodes.keys()
    }

    pub fn services_on(
        &self,
        compute: &ComputeId,
    ) -> Option<&BTreeMap<ServiceName, BTreeMap<ConfigKey, usize>>> {
        self.nodes.get(compute)
    }

    pub fn count(&self, compute: &ComputeId, service: &str, config: &ConfigKey) -> usize {
        self.nodes
            .get(compute)
            .and_then(|svcs| svcs.get(&ServiceName::new_unchecked(service)))
            .and_then(|cfgs| cfgs.get(config))
            .copied()
            .unwrap_or(0)
    }

    /// Iterate every (compute, service, config, count) slot in deterministic
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&ComputeId, &ServiceName, &ConfigKey, usize)> {
        self.nodes.iter().flat_map(|(compute, svcs)| {
            svcs.iter().flat_map(move |(svc, cfgs)| {
                cfgs.iter().map(move |(cfg, count)| (compute, svc, cfg, *count))
            })
        })
    }

    fn check_any_mixing(&self) -> Result<(), LayoutError> {
        if self.uses_any() && self.nodes.len() > 1 {
            return Err(LayoutError::MixedAny);
        }
        Ok(())
    }

    // ── JSON boundary ────────────────────────────────────────────────────────

    /// Parse a layout from its JSON file shape:
    ///
    /// ```json
    /// {
    ///   "cn1": {
    ///     "moray":  { "1": { "img-a": 3 } },
    ///     "medusa": { "img-b": 2 }
    ///   }
    /// }
    /// ```
    ///
    /// Sharded services nest shard → image → count; others nest image →
    /// count. Shapes that disagree with the catalog are rejected.
    pub fn from_json_str(text: &str, path: &str) -> Result<Self, LayoutError> {
        let root: Value = serde_json::from_str(text).map_err(|e| LayoutError::JsonParse {
            path: path.to_string(),
            source: e,
        })?;
        let obj = as_object(&root, path, "layout root")?;

        let mut layout = DesiredLayout::new();
        for (compute, services) in obj {
            let compute_id = ComputeId::new(compute);
            let services = as_object(services, path, &format!("compute {}", compute))?;
            for (service, configs) in services {
                if !catalog::is_valid(service) {
                    return Err(LayoutError::Invalid {
                        path: path.to_string(),
                        message: format!("unknown service '{}'", service),
                    });
                }
                let sharded = catalog::is_sharded(service)?;
                let configs = as_object(configs, path, &format!("service {}", service))?;
                if sharded {
                    for (shard, images) in configs {
                        let shard: u32 = shard.parse().map_err(|_| LayoutError::Invalid {
                            path: path.to_string(),
                            message: format!("service {}: bad shard '{}'", service, shard),
                        })?;
                        let images =
                            as_object(images, path, &format!("service {} shard {}", service, shard))?;
                        for (image, count) in images {
                            let count = as_count(count, path, service)?;
                            layout.set_count(
                                compute_id.clone(),
                                service,
                                ConfigKey::ShardImage {
                                    shard,
                                    image: ImageId::new(image),
                                },
                                count,
                            )?;
                        }
                    }
                } else {
                    for (image, count) in configs {
                        let count = as_count(count, path, service)?;
                        layout.set_count(
                            compute_id.clone(),
                            service,
                            ConfigKey::Image {
                                image: ImageId::new(image),
                            },
                            count,
                        )?;
                    }
                }
            }
        }
        Ok(layout)
    }

    /// Serialize to the JSON file shape, inverse of [`Self::from_json_str`].
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (compute, services) in &self.nodes {
            let mut svc_obj = Map::new();
            for (service, configs) in services {
                let mut cfg_obj = Map::new();
                for (config, count) in configs {
                    match config {
                        ConfigKey::Image { image } => {
                            cfg_obj.insert(image.as_str().to_string(), Value::from(*count as u64));
                        }
                        ConfigKey::ShardImage { shard, image } => {
                            cfg_obj
                                .entry(shard.to_string())
                                .or_insert_with(|| Value::Object(Map::new()))
                                .as_object_mut()
                                .map(|m| {
                                    m.insert(
                                        image.as_str().to_string(),
                                        Value::from(*count as u64),
                                    )
                                });
                        }
                    }
                }
                svc_obj.insert(service.as_str().to_string(), Value::Object(cfg_obj));
            }
            root.insert(compute.as_str().to_string(), Value::Object(svc_obj));
        }
        Value::Object(root)
    }

    pub fn read(path: &Path) -> Result<Self, LayoutError> {
        let text = std::fs::read_to_string(path).map_err(|e| LayoutError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&text, &path.display().to_string())
    }

    pub fn write(&self, path: &Path) -> Result<(), LayoutError> {
        let text = serde_json::to_string_pretty(&self.to_json()).map_err(|e| {
            LayoutError::JsonParse {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        std::fs::write(path, text + "\n").map_err(|e| LayoutError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

fn as_object<'a>(
    value: &'a Value,
    path: &str,
    what: &str,
) -> Result<&'a Map<String, Value>, LayoutError> {
    value.as_object().ok_or_else(|| LayoutError::Invalid {
        path: path.to_string(),
        message: format!("{} must be an object", what),
    })
}

fn as_count(value: &Value, path: &str, service: &str) -> Result<usize, LayoutError> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| LayoutError::Invalid {
            path: path.to_string(),
            message: format!("service {}: count must be a nonnegative integer", service),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cn1": {
            "moray":  { "1": { "img-a": 3 } },
            "medusa": { "img-b": 2 }
        },
        "cn2": {
            "moray": { "2": { "img-a": 3 } }
        }
    }"#;

    #[test]
    fn parses_sharded_and_plain_services() {
        let layout = DesiredLayout::from_json_str(SAMPLE, "test.json").unwrap();
        assert_eq!(
            layout.count(
                &ComputeId::new("cn1"),
                "moray",
                &ConfigKey::ShardImage { shard: 1, image: ImageId::new("img-a") }
            ),
            3
        );
        assert_eq!(
            layout.count(
                &ComputeId::new("cn1"),
                "medusa",
                &ConfigKey::Image { image: ImageId::new("img-b") }
            ),
            2
        );
    }

    #[test]
    fn rejects_unknown_service() {
        let err = DesiredLayout::from_json_str(r#"{"cn1": {"frob": {"i": 1}}}"#, "t.json")
            .unwrap_err();
        assert!(matches!(err, LayoutError::Invalid { .. }));
    }

    #[test]
    fn rejects_shard_on_unsharded_service() {
        // medusa's config key is (image); a nested shard object means the
        // "image" key maps to an object rather than a count.
        let err = DesiredLayout::from_json_str(
            r#"{"cn1": {"medusa": {"1": {"img-b": 2}}}}"#,
            "t.json",
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Invalid { .. }));
    }

    #[test]
    fn rejects_any_mixed_with_pinned() {
        let err = DesiredLayout::from_json_str(
            r#"{"<any>": {"medusa": {"img-b": 1}}, "cn1": {"medusa": {"img-b": 1}}}"#,
            "t.json",
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::MixedAny));
    }

    #[test]
    fn any_alone_is_legal() {
        let layout =
            DesiredLayout::from_json_str(r#"{"<any>": {"medusa": {"img-b": 4}}}"#, "t.json")
                .unwrap();
        assert!(layout.uses_any());
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let layout = DesiredLayout::from_json_str(SAMPLE, "test.json").unwrap();
        let text = serde_json::to_string(&layout.to_json()).unwrap();
        let back = DesiredLayout::from_json_str(&text, "back.json").unwrap();
        assert_eq!(layout, back);
    }
}
