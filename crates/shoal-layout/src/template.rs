use shoal_domain::{catalog, ComputeId, ConfigKey, ServiceName};
use shoal_inventory::FleetSnapshot;
use tracing::debug;

use crate::error::LayoutError;
use crate::layout::DesiredLayout;

/// Built-in single-node deployment shapes. Both place everything on the head
/// node; they differ only in instance counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutTemplate {
    /// Minimal footprint for one-box installs.
    Standalone,
    /// Fuller footprint for shared development hardware.
    Development,
}

impl LayoutTemplate {
    /// Per-service instance counts. Services absent here get none; sharded
    /// services deploy a single shard 1.
    fn counts(&self) -> &'static [(&'static str, usize)] {
        match self {
            LayoutTemplate::Standalone => &[
                ("nameservice", 1),
                ("postgres", 2),
                ("moray", 1),
                ("electric-moray", 1),
                ("authcache", 1),
                ("storage", 2),
                ("medusa", 1),
                ("loadbalancer", 1),
                ("ops", 1),
            ],
            LayoutTemplate::Development => &[
                ("nameservice", 3),
                ("postgres", 3),
                ("moray", 3),
                ("electric-moray", 1),
                ("authcache", 1),
                ("storage", 3),
                ("medusa", 2),
                ("loadbalancer", 2),
                ("ops", 1),
                ("madtom", 1),
            ],
        }
    }

    /// Generate the desired layout for this template: every instance on the
    /// deployment's single head node, at each service's newest image.
    pub fn generate(&self, snapshot: &FleetSnapshot) -> Result<DesiredLayout, LayoutError> {
        let head = snapshot.head_node().ok_or_else(|| {
            let candidates = snapshot
                .compute_nodes
                .values()
                .filter(|cn| cn.headnode)
                .count();
            LayoutError::HeadNodeNotUnique(candidates)
        })?;
        debug!(compute_id = %head.compute_id, "template layout targets head node");

        let mut layout = DesiredLayout::new();
        for (service, count) in self.counts() {
            let image = snapshot
                .latest_images
                .get(&ServiceName::new_unchecked(*service))
                .cloned()
                .ok_or_else(|| LayoutError::MissingImage(service.to_string()))?;
            let config = if catalog::is_sharded(service)? {
                ConfigKey::ShardImage { shard: 1, image }
            } else {
                ConfigKey::Image { image }
            };
            layout.set_count(head.compute_id.clone(), service, config, *count)?;
        }
        Ok(layout)
    }
}
