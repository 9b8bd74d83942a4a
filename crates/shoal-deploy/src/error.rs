use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("layout error: {0}")]
    Layout(#[from] shoal_layout::LayoutError),

    #[error("domain error: {0}")]
    Domain(#[from] shoal_domain::DomainError),

    #[error("internal planner error: {0}")]
    Internal(String),
}
