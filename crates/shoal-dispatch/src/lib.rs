pub mod amqp;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod result;
pub mod scope;
pub mod transport;

pub use amqp::{AmqpConfig, AmqpTransport};
pub use dispatch::{Dispatcher, DispatchOptions, FleetOperation};
pub use error::DispatchError;
pub use format::{consume, DispatchSummary, OutputFormat, TextMode};
pub use result::{ResultError, ResultEvent};
pub use scope::{resolve_scope, Scope, Target};
pub use transport::{
    AgentReply, AgentRequest, Behavior, CommandTransport, MemoryTransport, TransportError,
};
