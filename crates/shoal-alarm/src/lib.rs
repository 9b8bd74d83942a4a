pub mod api;
pub mod apply;
pub mod error;
pub mod events;
pub mod maint;
pub mod plan;
pub mod wanted;

pub use api::{
    Alarm, Fault, HttpMonitor, HttpMonitorConfig, MaintScope, MaintWindow, MemoryMonitor,
    MonitoringApi, NewMaintWindow, NewProbe, NewProbeGroup, Probe, ProbeGroup,
};
pub use apply::{apply_plan, ApplyOptions, ApplySummary};
pub use error::AlarmError;
pub use events::{
    event_catalog, group_name, is_removable_group_name, CheckTemplate, EventScope, EventTemplate,
    KnowledgeArticle, Severity,
};
pub use maint::create_window;
pub use plan::{build_update_plan, load_deployed, AlarmUpdatePlan, DeployedConfig, PendingProbe};
pub use wanted::{compute_wanted, WantedGroup, WantedProbe};
