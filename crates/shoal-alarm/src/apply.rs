use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::api::MonitoringApi;
use crate::error::AlarmError;
use crate::plan::AlarmUpdatePlan;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub account: String,
    /// Worker-pool width for each phase.
    pub concurrency: usize,
}

impl ApplyOptions {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            concurrency: 10,
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplySummary {
    pub probes_removed: usize,
    pub groups_removed: usize,
    pub groups_added: usize,
    pub probes_added: usize,
    /// Per-item failures. A failed group creation also fails that group's
    /// new probes; later phases run regardless.
    pub errors: Vec<String>,
}

impl ApplySummary {
    pub fn changed(&self) -> usize {
        self.probes_removed + self.groups_removed + self.groups_added + self.probes_added
    }
}

/// Apply an update plan in phases: delete stale probes, delete stale groups,
/// create new groups (capturing server-assigned ids), create new probes.
///
/// Each phase runs under a bounded worker pool. Per-item failures are
/// collected into the summary so one bad item cannot wedge the batch.
pub async fn apply_plan(
    monitor: Arc<dyn MonitoringApi>,
    plan: &AlarmUpdatePlan,
    opts: &ApplyOptions,
) -> Result<ApplySummary, AlarmError> {
    let mut summary = ApplySummary::default();
    let concurrency = opts.concurrency.max(1);
    let account = opts.account.as_str();

    // Phase 1: stale probes.
    let results: Vec<Result<(), String>> = stream::iter(&plan.probes_to_remove)
        .map(|probe| {
            let monitor = monitor.clone();
            async move {
                monitor
                    .delete_probe(account, &probe.uuid)
                    .await
                    .map_err(|e| format!("delete probe {}: {}", probe.uuid, e))
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    collect(results, &mut summary.probes_removed, &mut summary.errors);

    // Phase 2: stale groups.
    let results: Vec<Result<(), String>> = stream::iter(&plan.groups_to_remove)
        .map(|group| {
            let monitor = monitor.clone();
            async move {
                monitor
                    .delete_probe_group(account, &group.uuid)
                    .await
                    .map_err(|e| format!("delete group {}: {}", group.name, e))
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    collect(results, &mut summary.groups_removed, &mut summary.errors);

    // Phase 3: new groups. The server assigns ids; record them in the
    // name → id index so phase 4 can resolve probe group ids.
    let mut index: HashMap<String, String> = plan.group_index.clone();
    let created: Vec<Result<(String, String), String>> = stream::iter(&plan.groups_to_add)
        .map(|group| {
            let monitor = monitor.clone();
            async move {
                monitor
                    .create_probe_group(account, group)
                    .await
                    .map(|g| (g.name, g.uuid))
                    .map_err(|e| format!("create group {}: {}", group.name, e))
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    for result in created {
        match result {
            Ok((name, uuid)) => {
                summary.groups_added += 1;
                index.insert(name, uuid);
            }
            Err(err) => {
                warn!(error = %err, "group creation failed");
                summary.errors.push(err);
            }
        }
    }

    // Phase 4: new probes, with group ids resolved through the index.
    let index = &index;
    let results: Vec<Result<(), String>> = stream::iter(&plan.probes_to_add)
        .map(|pending| {
            let monitor = monitor.clone();
            async move {
                let Some(group_id) = index.get(&pending.group_name) else {
                    return Err(format!(
                        "create probe {}: group {} was not created",
                        pending.probe.name, pending.group_name
                    ));
                };
                let mut probe = pending.probe.clone();
                probe.group_id = group_id.clone();
                monitor
                    .create_probe(account, &probe)
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("create probe {}: {}", pending.probe.name, e))
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
    collect(results, &mut summary.probes_added, &mut summary.errors);

    info!(
        changed = summary.changed(),
        errors = summary.errors.len(),
        "alarm configuration applied"
    );
    Ok(summary)
}

fn collect(results: Vec<Result<(), String>>, counter: &mut usize, errors: &mut Vec<String>) {
    for result in results {
        match result {
            Ok(()) => *counter += 1,
            Err(err) => {
                warn!(error = %err, "alarm apply item failed");
                errors.push(err);
            }
        }
    }
}
