//! 运行时配置
//!
//! 加载顺序：默认值 -> TOML 配置文件 -> 环境变量（前缀 `DATAFLOW`，层级分隔符 `__`）。
//!
//! ```rust,no_run
//! use dataflow_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/runtime.toml")).unwrap();
//! println!("调度策略: {:?}", config.scheduler.policy);
//! ```

pub mod models;

pub use models::{
    AppConfig, CoreElementConfig, ImplementationConfig, ObservabilityConfig, ResourcesConfig,
    RuntimeConfig, SchedulerConfig, SchedulingPolicyKind, WorkerConfig,
};
