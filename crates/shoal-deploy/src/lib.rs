pub mod backend;
pub mod error;
pub mod execute;
pub mod plan;

pub use backend::{
    BackendError, HttpBackend, HttpBackendConfig, MemoryBackend, ProvisionBackend,
    ProvisionRequest,
};
pub use error::DeployError;
pub use execute::{execute, ConfirmFn, ExecuteOptions, ExecutionReport, LaneFailure};
pub use plan::{plan, Operation, PlanOptions};
