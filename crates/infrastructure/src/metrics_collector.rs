//! 运行时指标采集
//!
//! 通过 `metrics` 门面记录，导出方式由宿主程序安装的 recorder 决定。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::{debug, warn};

use dataflow_domain::{CoreId, RuntimeMetrics};

pub struct MetricsCollector {
    transfer_failures_total: Counter,
    reschedules_total: Counter,
    pending_actions: Gauge,
    blocked_actions: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            transfer_failures_total: counter!("dataflow_transfer_failures_total"),
            reschedules_total: counter!("dataflow_reschedules_total"),
            pending_actions: gauge!("dataflow_pending_actions"),
            blocked_actions: gauge!("dataflow_blocked_actions"),
        }
    }

    fn core_histogram(core_id: CoreId) -> Histogram {
        histogram!("dataflow_job_duration_seconds", "core" => core_id.to_string())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics for MetricsCollector {
    fn record_task_submitted(&self, core_id: CoreId) {
        counter!("dataflow_tasks_submitted_total", "core" => core_id.to_string()).increment(1);
    }

    fn record_task_completed(&self, core_id: CoreId) {
        counter!("dataflow_tasks_completed_total", "core" => core_id.to_string()).increment(1);
    }

    fn record_task_failed(&self, core_id: CoreId) {
        counter!("dataflow_tasks_failed_total", "core" => core_id.to_string()).increment(1);
        warn!(core_id, "任务彻底失败");
    }

    fn record_job_submitted(&self, worker: &str) {
        counter!("dataflow_jobs_submitted_total", "worker" => worker.to_string()).increment(1);
    }

    fn record_job_failed(&self, worker: &str) {
        counter!("dataflow_jobs_failed_total", "worker" => worker.to_string()).increment(1);
    }

    fn record_job_duration(&self, core_id: CoreId, seconds: f64) {
        Self::core_histogram(core_id).record(seconds);
        debug!(core_id, duration_seconds = seconds, "作业耗时");
    }

    fn record_transfer_failure(&self) {
        self.transfer_failures_total.increment(1);
    }

    fn record_reschedule(&self) {
        self.reschedules_total.increment(1);
    }

    fn set_pending_actions(&self, count: usize) {
        self.pending_actions.set(count as f64);
    }

    fn set_blocked_actions(&self, count: usize) {
        self.blocked_actions.set(count as f64);
    }
}
