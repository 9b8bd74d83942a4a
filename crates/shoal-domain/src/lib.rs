pub mod catalog;
pub mod error;
pub mod types;

pub use catalog::ServiceDef;
pub use error::DomainError;
pub use types::{
    ComputeId, ComputeNode, ConfigKey, Image, ImageId, Instance, InstanceId, ServiceName,
};
