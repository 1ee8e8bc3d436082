pub mod app_config;
pub mod observability;
pub mod resources;
pub mod scheduler;

pub use app_config::AppConfig;
pub use observability::ObservabilityConfig;
pub use resources::{CoreElementConfig, ImplementationConfig, ResourcesConfig, WorkerConfig};
pub use scheduler::{RuntimeConfig, SchedulerConfig, SchedulingPolicyKind};
