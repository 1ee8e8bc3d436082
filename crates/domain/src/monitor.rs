use crate::models::{DataLocation, DataType, JobId, TaskId};
use dataflow_core::SchedulerError;

/// 应用侧的任务生命周期回调
///
/// 所有方法都有空的默认实现，按需覆盖。回调在运行时事件循环中同步调用，不应阻塞。
pub trait TaskMonitor: Send + Sync {
    fn on_creation(&self, _task_id: TaskId) {}

    fn on_schedule(&self, _task_id: TaskId, _worker: &str) {}

    fn on_submission(&self, _task_id: TaskId, _job_id: JobId) {}

    fn on_value_generated(
        &self,
        _task_id: TaskId,
        _param_index: usize,
        _data_type: DataType,
        _location: &DataLocation,
    ) {
    }

    fn on_successful_execution(&self, _task_id: TaskId) {}

    fn on_failed_execution(&self, _task_id: TaskId, _error: &SchedulerError) {}

    /// 单次尝试出错，后续仍可能重试
    fn on_error_execution(&self, _task_id: TaskId, _reason: &str) {}

    fn on_completion(&self, _task_id: TaskId) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl TaskMonitor for NoopMonitor {}
