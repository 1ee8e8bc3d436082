//! 外部协作方接口
//!
//! 作业提交、数据传输和持久化存储都由外部组件实现。异步完成通知通过监听器
//! 投递到运行时的事件通道，不直接修改执行动作的状态。

pub mod events;
pub mod job;
pub mod metrics;
pub mod storage;
pub mod transfer;

pub use events::*;
pub use job::*;
pub use metrics::*;
pub use storage::*;
pub use transfer::*;
