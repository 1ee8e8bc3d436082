use crate::models::CoreId;

/// 运行时指标记录接口，默认不记录
pub trait RuntimeMetrics: Send + Sync {
    fn record_task_submitted(&self, _core_id: CoreId) {}

    fn record_task_completed(&self, _core_id: CoreId) {}

    fn record_task_failed(&self, _core_id: CoreId) {}

    fn record_job_submitted(&self, _worker: &str) {}

    fn record_job_failed(&self, _worker: &str) {}

    fn record_job_duration(&self, _core_id: CoreId, _seconds: f64) {}

    fn record_transfer_failure(&self) {}

    fn record_reschedule(&self) {}

    fn set_pending_actions(&self, _count: usize) {}

    fn set_blocked_actions(&self, _count: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RuntimeMetrics for NoopMetrics {}
