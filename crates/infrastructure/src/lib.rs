//! 进程内协作方实现：模拟作业执行、内存数据传输、内存持久化存储与指标采集

pub mod in_memory_storage;
pub mod in_memory_transfer;
pub mod metrics_collector;
pub mod simulated_jobs;

pub use in_memory_storage::InMemoryPersistentStorage;
pub use in_memory_transfer::InMemoryTransferService;
pub use metrics_collector::MetricsCollector;
pub use simulated_jobs::{SimulatedJobSubmitter, SimulationConfig};
