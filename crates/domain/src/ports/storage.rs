use async_trait::async_trait;

use dataflow_core::SchedulerResult;

/// 持久化对象存储后端
///
/// 失败时返回 `SchedulerError::StorageBackend`，调用方不重试。
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    /// 持有该对象的Worker名称
    async fn locations(&self, id: &str) -> SchedulerResult<Vec<String>>;

    /// 在 `target_worker` 上创建新版本并返回新标识
    async fn new_version(
        &self,
        id: &str,
        preserve_source: bool,
        target_worker: &str,
    ) -> SchedulerResult<String>;
}
