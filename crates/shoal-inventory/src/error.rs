use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("duplicate instance id: {0}")]
    DuplicateInstance(String),

    #[error("instance {instance} references unknown service record {service_uuid}")]
    DanglingServiceRef {
        instance: String,
        service_uuid: String,
    },

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected upstream response from {url}: {message}")]
    BadResponse { url: String, message: String },

    #[error("domain error: {0}")]
    Domain(#[from] shoal_domain::DomainError),

    #[error("internal inventory error: {0}")]
    Internal(String),
}
