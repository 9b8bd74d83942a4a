use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service {service} is sharded; config key must carry a shard")]
    ShardRequired { service: String },

    #[error("service {service} is not sharded; config key must not carry a shard")]
    ShardUnexpected { service: String },

    #[error("invalid shard number: {0}")]
    InvalidShard(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
