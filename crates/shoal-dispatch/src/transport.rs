use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::Target;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The request could not be enqueued at all (broker unavailable, queue
    /// refused).
    #[error("could not enqueue request: {0}")]
    Dispatch(String),

    /// The request was enqueued but the exchange failed afterwards.
    #[error("transport failed: {0}")]
    Transport(String),
}

/// The operation shipped to a compute node's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Run a shell command, capturing exit status and output.
    Exec { script: String },
    /// Read a file and return its contents.
    GetFile { path: PathBuf },
    /// Write `contents` as `name` under `dir`.
    PutFile {
        dir: PathBuf,
        name: String,
        contents: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// File contents for GetFile replies.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl AgentReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            data: None,
        }
    }
}

/// One request/reply round trip to a target's agent. The dispatcher applies
/// the per-target deadline around this call.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    async fn dispatch(
        &self,
        target: &Target,
        request: &AgentRequest,
    ) -> Result<AgentReply, TransportError>;
}

// ── In-memory transport ──────────────────────────────────────────────────────

/// Scripted behavior for one target of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(AgentReply),
    DelayedReply(Duration, AgentReply),
    Fail(TransportError),
    /// Never reply; the dispatcher's deadline fires.
    Hang,
}

/// Transport fake keyed by target uuid. Targets without an entry reply with
/// exit 0 and empty output.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    behaviors: HashMap<String, Behavior>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn behave(mut self, uuid: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(uuid.to_string(), behavior);
        self
    }
}

#[async_trait]
impl CommandTransport for MemoryTransport {
    async fn dispatch(
        &self,
        target: &Target,
        _request: &AgentRequest,
    ) -> Result<AgentReply, TransportError> {
        match self.behaviors.get(target.uuid()) {
            None => Ok(AgentReply::ok("")),
            Some(Behavior::Reply(reply)) => Ok(reply.clone()),
            Some(Behavior::DelayedReply(delay, reply)) => {
                tokio::time::sleep(*delay).await;
                Ok(reply.clone())
            }
            Some(Behavior::Fail(err)) => Err(err.clone()),
            Some(Behavior::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
