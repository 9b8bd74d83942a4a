use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("monitoring request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected monitoring response from {url}: {message}")]
    BadResponse { url: String, message: String },

    #[error("instance {instance}: metadata key {key} required by probe environment is absent")]
    MissingMetadata { instance: String, key: String },

    #[error("maintenance window invalid: {0}")]
    WindowInvalid(String),

    #[error("alarm not found: {0}")]
    NotFound(u64),

    #[error("domain error: {0}")]
    Domain(#[from] shoal_domain::DomainError),

    #[error("inventory error: {0}")]
    Inventory(#[from] shoal_inventory::InventoryError),

    #[error("internal alarm error: {0}")]
    Internal(String),
}
