pub mod error;
pub mod hardware;
pub mod layout;
pub mod template;

pub use error::LayoutError;
pub use hardware::{
    generate_from_hardware, read_hardware_config, GeneratedLayouts, HardwareConfig,
};
pub use layout::DesiredLayout;
pub use template::LayoutTemplate;
