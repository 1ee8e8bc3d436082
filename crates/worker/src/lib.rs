//! Worker资源模型与资源池
//!
//! 资源池把已知Worker划分为静态、关键动态和非关键动态三类，并维护每种任务类型
//! 的可执行槽位总数。

pub mod elastic;
pub mod pool;
pub mod worker;

pub use elastic::{ElasticCapacity, PendingCreation};
pub use pool::{PoolState, WorkerPool, WorkerSet};
pub use worker::{Worker, WorkerKind};
