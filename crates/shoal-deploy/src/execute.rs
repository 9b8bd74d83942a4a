use std::collections::BTreeMap;
use std::sync::Arc;

use shoal_domain::{ComputeId, ImageId, InstanceId, ServiceName};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::{ProvisionBackend, ProvisionRequest};
use crate::error::DeployError;
use crate::plan::Operation;

/// Callback invoked before a non-dry run starts. Returning false aborts the
/// execution before any side effect.
pub type ConfirmFn = Box<dyn FnOnce(&[Operation]) -> bool + Send>;

pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Front-end confirmation hook; None means proceed unconditionally.
    pub confirm: Option<ConfirmFn>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            confirm: None,
        }
    }
}

/// One lane that stopped early: its remaining operations were skipped, other
/// lanes were unaffected.
#[derive(Debug, Clone)]
pub struct LaneFailure {
    pub service: ServiceName,
    pub compute: ComputeId,
    pub error: String,
    pub skipped: usize,
}

impl std::fmt::Display for LaneFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}: {} ({} operation(s) skipped)",
            self.service, self.compute, self.error, self.skipped
        )
    }
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Operations performed, or in a dry run, the operations that would be.
    pub executed: Vec<Operation>,
    pub failures: Vec<LaneFailure>,
    pub dry_run: bool,
    /// True when the confirmation hook declined the run.
    pub aborted: bool,
}

impl ExecutionReport {
    pub fn count(&self) -> usize {
        self.executed.len()
    }
}

/// Drive the plan against the provisioning backend.
///
/// Services execute sequentially in plan (catalog) order. Within a service,
/// operations for distinct compute nodes run in parallel; operations on the
/// same compute node run sequentially in plan order. A failure aborts only
/// the remaining operations in its own (service, compute) lane.
///
/// Concurrent invocations against the same fleet are not guarded here;
/// callers serialize externally and re-run the planner to converge.
pub async fn execute(
    plan: &[Operation],
    backend: Arc<dyn ProvisionBackend>,
    opts: ExecuteOptions,
) -> Result<ExecutionReport, DeployError> {
    let mut report = ExecutionReport {
        dry_run: opts.dry_run,
        ..Default::default()
    };

    if plan.is_empty() {
        info!("no changes to execute");
        return Ok(report);
    }

    if opts.dry_run {
        for op in plan {
            info!(operation = %op, "dry run");
            report.executed.push(op.clone());
        }
        return Ok(report);
    }

    if let Some(confirm) = opts.confirm {
        if !confirm(plan) {
            report.aborted = true;
            return Ok(report);
        }
    }

    // Consecutive runs of the same service form one sequential stage; the
    // planner already emits services in catalog order.
    let mut stages: Vec<(ServiceName, Vec<Operation>)> = Vec::new();
    for op in plan {
        let same_stage = stages
            .last()
            .is_some_and(|(service, _)| service == op.service());
        if !same_stage {
            stages.push((op.service().clone(), Vec::new()));
        }
        if let Some((_, ops)) = stages.last_mut() {
            ops.push(op.clone());
        }
    }

    for (service, ops) in stages {
        let mut lanes: BTreeMap<ComputeId, Vec<Operation>> = BTreeMap::new();
        for op in ops {
            lanes.entry(op.compute().clone()).or_default().push(op);
        }
        info!(service = %service, lanes = lanes.len(), "executing service stage");

        let mut set: JoinSet<(Vec<Operation>, Option<LaneFailure>)> = JoinSet::new();
        for (compute, lane_ops) in lanes {
            let backend = backend.clone();
            let service = service.clone();
            set.spawn(async move { run_lane(service, compute, lane_ops, backend).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((executed, failure)) => {
                    report.executed.extend(executed);
                    if let Some(failure) = failure {
                        report.failures.push(failure);
                    }
                }
                Err(err) => {
                    return Err(DeployError::Internal(format!("executor lane panicked: {}", err)))
                }
            }
        }
    }

    info!(
        executed = report.executed.len(),
        failures = report.failures.len(),
        "execution complete"
    );
    Ok(report)
}

async fn run_lane(
    service: ServiceName,
    compute: ComputeId,
    ops: Vec<Operation>,
    backend: Arc<dyn ProvisionBackend>,
) -> (Vec<Operation>, Option<LaneFailure>) {
    let mut executed = Vec::with_capacity(ops.len());
    let total = ops.len();
    for (index, op) in ops.into_iter().enumerate() {
        info!(operation = %op, "executing");
        let result = apply(&op, backend.as_ref()).await;
        match result {
            Ok(()) => executed.push(op),
            Err(err) => {
                warn!(
                    service = %service,
                    compute = %compute,
                    error = %err,
                    "lane aborted"
                );
                let failure = LaneFailure {
                    service,
                    compute,
                    error: err,
                    skipped: total - index - 1,
                };
                return (executed, Some(failure));
            }
        }
    }
    (executed, None)
}

async fn apply(op: &Operation, backend: &dyn ProvisionBackend) -> Result<(), String> {
    match op {
        Operation::Provision {
            service,
            config,
            compute,
            ..
        } => {
            let request = ProvisionRequest {
                service: service.clone(),
                image: config.image().clone(),
                compute: if compute.is_any() {
                    None
                } else {
                    Some(compute.clone())
                },
                shard: config.shard(),
            };
            let instance = backend.provision(&request).await.map_err(|e| e.to_string())?;
            info!(instance = %instance, service = %service, "provisioned");
            Ok(())
        }
        Operation::Deprovision { instance_id, .. } => {
            backend.deprovision(instance_id).await.map_err(|e| e.to_string())
        }
        Operation::Reprovision {
            instance_id,
            new_image,
            ..
        } => backend
            .reprovision(instance_id, new_image)
            .await
            .map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend};
    use shoal_domain::ConfigKey;

    fn provision(service: &str, image: &str, compute: &str) -> Operation {
        Operation::Provision {
            service: ServiceName::new_unchecked(service),
            config: ConfigKey::Image {
                image: ImageId::new(image),
            },
            compute: ComputeId::new(compute),
            reason: "test".to_string(),
        }
    }

    fn deprovision(service: &str, image: &str, compute: &str, instance: &str) -> Operation {
        Operation::Deprovision {
            service: ServiceName::new_unchecked(service),
            config: ConfigKey::Image {
                image: ImageId::new(image),
            },
            compute: ComputeId::new(compute),
            instance_id: InstanceId::new(instance),
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn executes_every_operation() {
        let backend = Arc::new(MemoryBackend::new());
        let plan = vec![
            provision("medusa", "img-b", "cn1"),
            provision("medusa", "img-b", "cn2"),
            deprovision("storage", "img-s", "cn1", "i-old"),
        ];
        let report = execute(&plan, backend.clone(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report.count(), 3);
        assert!(report.failures.is_empty());
        assert_eq!(backend.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let plan = vec![provision("medusa", "img-b", "cn1")];
        let report = execute(
            &plan,
            backend.clone(),
            ExecuteOptions {
                dry_run: true,
                confirm: None,
            },
        )
        .await
        .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.count(), 1);
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn declined_confirmation_aborts() {
        let backend = Arc::new(MemoryBackend::new());
        let plan = vec![provision("medusa", "img-b", "cn1")];
        let report = execute(
            &plan,
            backend.clone(),
            ExecuteOptions {
                dry_run: false,
                confirm: Some(Box::new(|_| false)),
            },
        )
        .await
        .unwrap();
        assert!(report.aborted);
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn failure_aborts_only_its_own_lane() {
        let backend = Arc::new(MemoryBackend::new().fail_instance("i-bad"));
        // Lane cn1: deprovision i-bad (fails), then a skipped provision.
        // Lane cn2: unaffected.
        let plan = vec![
            deprovision("medusa", "img-a", "cn1", "i-bad"),
            provision("medusa", "img-b", "cn1"),
            provision("medusa", "img-b", "cn2"),
        ];
        let report = execute(&plan, backend.clone(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].skipped, 1);
        assert_eq!(report.failures[0].compute.as_str(), "cn1");
        // Only cn2's provision landed.
        let calls = backend.calls().await;
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], BackendCall::Provision(_)));
    }

    #[tokio::test]
    async fn in_lane_order_is_preserved() {
        let backend = Arc::new(MemoryBackend::new());
        let plan = vec![
            provision("medusa", "img-b", "cn1"),
            deprovision("medusa", "img-a", "cn1", "i-1"),
            provision("medusa", "img-b", "cn1"),
            deprovision("medusa", "img-a", "cn1", "i-2"),
        ];
        execute(&plan, backend.clone(), ExecuteOptions::default())
            .await
            .unwrap();

        let calls = backend.calls().await;
        let kinds: Vec<&str> = calls
            .iter()
            .map(|c| match c {
                BackendCall::Provision(_) => "p",
                BackendCall::Deprovision(_) => "d",
                BackendCall::Reprovision(_, _) => "r",
            })
            .collect();
        assert_eq!(kinds, vec!["p", "d", "p", "d"]);
    }
}
