pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AppConfig, CoreElementConfig, ImplementationConfig, ObservabilityConfig, ResourcesConfig,
    RuntimeConfig, SchedulerConfig, SchedulingPolicyKind, WorkerConfig,
};
pub use errors::*;
pub use logging::{init_tracing, LogConfig, LogLevel, OutputFormat};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
