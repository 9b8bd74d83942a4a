use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::result::ResultEvent;
use crate::scope::Target;
use crate::transport::{AgentReply, AgentRequest, CommandTransport};

/// The operation to run against every target in scope.
#[derive(Debug, Clone)]
pub enum FleetOperation {
    /// Run a shell command on each target.
    Command(String),
    /// Fetch `remote_path` from each target into `local_dir`, named
    /// `<target uuid>.<basename>`.
    Get {
        remote_path: PathBuf,
        local_dir: PathBuf,
    },
    /// Push `local_path` into `remote_dir` on each target.
    Put {
        local_path: PathBuf,
        remote_dir: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum simultaneously outstanding operations.
    pub concurrency: usize,
    /// Per-target deadline for the full publish/reply round trip.
    pub exec_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 30,
            exec_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn CommandTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    /// Run the operation against every target, delivering one result per
    /// target on the returned stream in completion order.
    ///
    /// At most `concurrency` operations are outstanding at once; each has
    /// its own deadline. Flipping `cancel` to true stops new operations from
    /// being scheduled (they produce no result); in-flight operations run to
    /// their deadlines, after which the stream closes.
    pub async fn run(
        &self,
        targets: Vec<Target>,
        operation: FleetOperation,
        opts: &DispatchOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ResultEvent>, DispatchError> {
        // Input errors surface before anything is dispatched.
        let put_payload = match &operation {
            FleetOperation::Put { local_path, .. } => {
                let contents =
                    tokio::fs::read(local_path)
                        .await
                        .map_err(|e| DispatchError::Io {
                            path: local_path.display().to_string(),
                            source: e,
                        })?;
                Some(contents)
            }
            _ => None,
        };

        info!(
            targets = targets.len(),
            concurrency = opts.concurrency,
            "dispatching fleet operation"
        );

        // The channel holds every result so producers never block on a slow
        // consumer; buffered delivery is just a consumer that drains late.
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let operation = Arc::new(operation);
        let put_payload = put_payload.map(Arc::new);

        for target in targets {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let transport = self.transport.clone();
            let operation = operation.clone();
            let put_payload = put_payload.clone();
            let cancel = cancel.clone();
            let timeout = opts.exec_timeout;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if *cancel.borrow() {
                    debug!(target = target.uuid(), "cancelled before dispatch");
                    return;
                }

                let request = build_request(&operation, put_payload.as_deref());
                let event =
                    match tokio::time::timeout(timeout, transport.dispatch(&target, &request))
                        .await
                    {
                        Err(_) => {
                            warn!(target = target.uuid(), "operation timed out");
                            ResultEvent::timeout(target, timeout)
                        }
                        Ok(Err(err)) => ResultEvent::transport_failure(target, err),
                        Ok(Ok(reply)) => finish(&operation, target, reply).await,
                    };
                let _ = tx.send(event).await;
            });
        }

        Ok(rx)
    }
}

fn build_request(operation: &FleetOperation, put_payload: Option<&Vec<u8>>) -> AgentRequest {
    match operation {
        FleetOperation::Command(script) => AgentRequest::Exec {
            script: script.clone(),
        },
        FleetOperation::Get { remote_path, .. } => AgentRequest::GetFile {
            path: remote_path.clone(),
        },
        FleetOperation::Put {
            local_path,
            remote_dir,
        } => AgentRequest::PutFile {
            dir: remote_dir.clone(),
            name: basename(local_path),
            contents: put_payload.cloned().unwrap_or_default(),
        },
    }
}

/// Post-process a successful reply: for fetches, write the file locally.
async fn finish(operation: &FleetOperation, target: Target, reply: AgentReply) -> ResultEvent {
    if let FleetOperation::Get {
        remote_path,
        local_dir,
    } = operation
    {
        if reply.exit_status == 0 {
            let path = local_dir.join(format!("{}.{}", target.uuid(), basename(remote_path)));
            let contents = reply.data.clone().unwrap_or_default();
            if let Err(err) = tokio::fs::write(&path, contents).await {
                return ResultEvent::local_failure(
                    target,
                    format!("writing {}: {}", path.display(), err),
                );
            }
        }
    }
    ResultEvent::from_reply(target, reply)
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AgentReply, Behavior, MemoryTransport, TransportError};
    use shoal_domain::{ComputeId, InstanceId, ServiceName};

    fn target(uuid: &str) -> Target {
        Target::Instance {
            instance_id: InstanceId::new(uuid),
            service: ServiceName::new_unchecked("medusa"),
            compute: ComputeId::new("cn1"),
            hostname: "host01".to_string(),
            primary_address: Some("10.0.0.5".to_string()),
        }
    }

    fn reply(exit: i32, stdout: &str) -> AgentReply {
        AgentReply {
            exit_status: exit,
            stdout: stdout.to_string(),
            stderr: String::new(),
            data: None,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<ResultEvent>) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn no_cancel() -> watch::Receiver<bool> {
        // A dropped sender freezes the value at false, which is all the
        // dispatcher ever reads.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_results_arrive_in_completion_order() {
        let transport = MemoryTransport::new()
            .behave(
                "i-ok",
                Behavior::DelayedReply(Duration::from_millis(100), reply(0, "fine")),
            )
            .behave(
                "i-bad",
                Behavior::DelayedReply(Duration::from_millis(200), reply(1, "broken")),
            )
            .behave("i-gone", Behavior::Hang);
        let dispatcher = Dispatcher::new(Arc::new(transport));
        let opts = DispatchOptions {
            concurrency: 2,
            exec_timeout: Duration::from_secs(5),
        };

        let rx = dispatcher
            .run(
                vec![target("i-ok"), target("i-bad"), target("i-gone")],
                FleetOperation::Command("svcs".to_string()),
                &opts,
                no_cancel(),
            )
            .await
            .unwrap();
        let events = drain(rx).await;

        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["ok", "nonzero", "timeout"]);
        let failures = events.iter().filter(|e| e.is_failure()).count();
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_target_produces_exactly_one_result() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryTransport::new()));
        let targets: Vec<Target> = (0..50).map(|i| target(&format!("i-{}", i))).collect();
        let rx = dispatcher
            .run(
                targets.clone(),
                FleetOperation::Command("true".to_string()),
                &DispatchOptions::default(),
                no_cancel(),
            )
            .await
            .unwrap();
        let events = drain(rx).await;

        let mut got: Vec<&str> = events.iter().map(|e| e.target.uuid()).collect();
        let mut expected: Vec<&str> = targets.iter().map(|t| t.uuid()).collect();
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_errors_are_distinct_from_timeouts() {
        let transport = MemoryTransport::new().behave(
            "i-err",
            Behavior::Fail(TransportError::Dispatch("broker unavailable".to_string())),
        );
        let dispatcher = Dispatcher::new(Arc::new(transport));
        let rx = dispatcher
            .run(
                vec![target("i-err")],
                FleetOperation::Command("true".to_string()),
                &DispatchOptions::default(),
                no_cancel(),
            )
            .await
            .unwrap();
        let events = drain(rx).await;
        assert_eq!(events[0].kind(), "dispatch_error");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_scheduling() {
        let (cancel_tx, cancel_rx) = watch::channel(true);
        let dispatcher = Dispatcher::new(Arc::new(MemoryTransport::new()));
        let rx = dispatcher
            .run(
                vec![target("i-1"), target("i-2")],
                FleetOperation::Command("true".to_string()),
                &DispatchOptions::default(),
                cancel_rx,
            )
            .await
            .unwrap();
        let events = drain(rx).await;
        assert!(events.is_empty());
        drop(cancel_tx);
    }

    #[tokio::test]
    async fn get_writes_one_file_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().behave(
            "i-1",
            Behavior::Reply(AgentReply {
                exit_status: 0,
                stdout: String::new(),
                stderr: String::new(),
                data: Some(b"contents".to_vec()),
            }),
        );
        let dispatcher = Dispatcher::new(Arc::new(transport));
        let rx = dispatcher
            .run(
                vec![target("i-1")],
                FleetOperation::Get {
                    remote_path: PathBuf::from("/var/log/app.log"),
                    local_dir: dir.path().to_path_buf(),
                },
                &DispatchOptions::default(),
                no_cancel(),
            )
            .await
            .unwrap();
        let events = drain(rx).await;
        assert_eq!(events[0].kind(), "ok");

        let fetched = dir.path().join("i-1.app.log");
        assert_eq!(std::fs::read(&fetched).unwrap(), b"contents");
    }

    #[tokio::test]
    async fn put_with_missing_local_file_fails_before_dispatch() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryTransport::new()));
        let err = dispatcher
            .run(
                vec![target("i-1")],
                FleetOperation::Put {
                    local_path: PathBuf::from("/nonexistent/file"),
                    remote_dir: PathBuf::from("/tmp"),
                },
                &DispatchOptions::default(),
                no_cancel(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Io { .. }));
    }
}
