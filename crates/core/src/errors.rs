use thiserror::Error;

/// 运行时错误类型定义
///
/// 瞬时类错误（传输、作业提交）在执行动作内部消化，只有在重试预算耗尽后才会向外传播。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: u64 },

    #[error("执行动作未找到: {id}")]
    ActionNotFound { id: u64 },

    #[error("Worker未找到: {name}")]
    WorkerNotFound { name: String },

    #[error("未注册的任务类型: {id}")]
    UnknownCoreElement { id: usize },

    #[error("操作了未注册的数据: {id}")]
    UnregisteredData { id: u64 },

    #[error("任务 {task_id} 在 Worker {worker} 上的输入传输失败 ({attempts} 次尝试)")]
    TransferFailed {
        task_id: u64,
        worker: String,
        attempts: u32,
    },

    #[error("任务 {task_id} 的作业 {job_id} 执行失败: {reason}")]
    JobFailed {
        task_id: u64,
        job_id: u64,
        reason: String,
    },

    #[error("任务 {task_id} 已没有可用的候选Worker")]
    PlacementExhausted { task_id: u64 },

    #[error("任务 '{name}' (ID: {task_id}) 彻底失败，作业记录: job[{}]", join_ids(.jobs))]
    TaskFailed {
        task_id: u64,
        name: String,
        jobs: Vec<u64>,
    },

    #[error("应用 {app_id} 中有任务失败: {failed_tasks:?}")]
    ApplicationFailed { app_id: u64, failed_tasks: Vec<u64> },

    #[error("应用 {app_id} 已结束，不再接受新任务")]
    ApplicationClosed { app_id: u64 },

    #[error("持久化存储错误: {0}")]
    StorageBackend(String),

    #[error("Worker {name} 是关键资源，不能移除")]
    CriticalWorker { name: String },

    #[error("弹性资源数量受限: {reason}")]
    ElasticLimit { reason: String },

    #[error("Worker {name} 仍有正在执行的动作")]
    WorkerBusy { name: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("运行时事件通道已关闭")]
    ChannelClosed,

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

impl SchedulerError {
    /// 是否属于可在执行动作内部重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::TransferFailed { .. } | SchedulerError::JobFailed { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failed_lists_every_job() {
        let err = SchedulerError::TaskFailed {
            task_id: 7,
            name: "increment".to_string(),
            jobs: vec![3, 4, 9],
        };
        let message = err.to_string();
        assert!(message.contains("increment"));
        assert!(message.contains("job[3|4|9]"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SchedulerError::TransferFailed {
            task_id: 1,
            worker: "w1".to_string(),
            attempts: 2
        }
        .is_transient());
        assert!(!SchedulerError::StorageBackend("down".to_string()).is_transient());
        assert!(!SchedulerError::PlacementExhausted { task_id: 1 }.is_transient());
    }
}
