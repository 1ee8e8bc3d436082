//! 运行时调度核心
//!
//! 依赖分析、执行动作状态机、Worker级调度器与调度请求队列，由单一事件循环驱动。

pub mod controller;
pub mod data_registry;
pub mod dependency_tracker;
pub mod engine;
pub mod events;
pub mod execution_action;
pub mod resource_scheduler;
pub mod scheduling_queue;
pub mod strategies;

pub use controller::{Runtime, RuntimeBuilder, RuntimeReport};
pub use data_registry::DataRegistry;
pub use dependency_tracker::{AnalysedTask, AppReport, DependencyTracker, TaskEndReport};
pub use engine::Collaborators;
pub use execution_action::{ActionState, ExecutionAction, RetryPolicy};
pub use resource_scheduler::ResourceScheduler;
pub use scheduling_queue::SchedulingQueue;
pub use strategies::*;
