use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scope::Target;
use crate::transport::{AgentReply, TransportError};

/// Structured failure attached to a result instead of an exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultError {
    /// No reply within the per-target deadline.
    Timeout { after_ms: u64 },
    /// The request could not be enqueued.
    Dispatch { message: String },
    /// The exchange failed after enqueueing.
    Transport { message: String },
}

/// One entry on the dispatch result stream: exactly one per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub target: Target,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ResultError>,
}

impl ResultEvent {
    pub fn from_reply(target: Target, reply: AgentReply) -> Self {
        Self {
            target,
            exit_status: Some(reply.exit_status),
            stdout: reply.stdout,
            stderr: reply.stderr,
            error: None,
        }
    }

    pub fn timeout(target: Target, after: Duration) -> Self {
        Self {
            target,
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(ResultError::Timeout {
                after_ms: after.as_millis() as u64,
            }),
        }
    }

    pub fn transport_failure(target: Target, err: TransportError) -> Self {
        let error = match err {
            TransportError::Dispatch(message) => ResultError::Dispatch { message },
            TransportError::Transport(message) => ResultError::Transport { message },
        };
        Self {
            target,
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
        }
    }

    pub fn local_failure(target: Target, message: String) -> Self {
        Self {
            target,
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(ResultError::Dispatch { message }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match (&self.error, self.exit_status) {
            (Some(ResultError::Timeout { .. }), _) => "timeout",
            (Some(ResultError::Dispatch { .. }), _) => "dispatch_error",
            (Some(ResultError::Transport { .. }), _) => "transport_error",
            (None, Some(0)) => "ok",
            (None, _) => "nonzero",
        }
    }

    /// Whether this result counts against the process exit status.
    pub fn is_failure(&self) -> bool {
        self.kind() != "ok"
    }
}
