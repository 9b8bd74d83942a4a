pub mod error;
pub mod ring;

pub use error::RingError;
pub use ring::{audit, repair, RingAudit, RingConfig, RingEntry, RingProblem, RingRepair};
