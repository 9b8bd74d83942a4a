use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("application metadata has no {0} property")]
    PropertyMissing(String),

    #[error("malformed ring property: {0}")]
    BadProperty(String),

    #[error("ring has {0} validation error(s); refusing to repair")]
    Unrepairable(usize),

    #[error("inventory error: {0}")]
    Inventory(#[from] shoal_inventory::InventoryError),
}
