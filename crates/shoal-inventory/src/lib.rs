pub mod api;
pub mod error;
pub mod http;
pub mod memory;
pub mod snapshot;

pub use api::{
    Application, ComputeNodeRecord, ImageRecord, InstanceRecord, InventoryApi, ServiceRecord,
    VmRecord,
};
pub use error::InventoryError;
pub use http::{HttpInventory, HttpInventoryConfig};
pub use memory::{MemoryInventory, MemoryInventoryBuilder};
pub use snapshot::{load_snapshot, FleetSnapshot, LoaderOptions, ServiceCounts};
