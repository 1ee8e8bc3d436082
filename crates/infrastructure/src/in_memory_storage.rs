use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use dataflow_core::{SchedulerError, SchedulerResult};
use dataflow_domain::PersistentStorage;

#[derive(Debug, Default)]
struct StorageTables {
    /// 对象标识 -> 持有该对象的Worker
    objects: HashMap<String, BTreeSet<String>>,
    /// 基础标识 -> 已生成的版本数
    versions: HashMap<String, u32>,
}

/// 内存持久化存储，版本标识为 `<基础标识>.v<n>`
#[derive(Debug, Default)]
pub struct InMemoryPersistentStorage {
    tables: RwLock<StorageTables>,
}

impl InMemoryPersistentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记对象在某个Worker上的副本
    pub async fn register(&self, id: &str, worker: &str) {
        self.tables
            .write()
            .await
            .objects
            .entry(id.to_string())
            .or_default()
            .insert(worker.to_string());
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tables.read().await.objects.contains_key(id)
    }

    fn base_id(id: &str) -> &str {
        id.split_once(".v").map_or(id, |(base, _)| base)
    }
}

#[async_trait]
impl PersistentStorage for InMemoryPersistentStorage {
    async fn locations(&self, id: &str) -> SchedulerResult<Vec<String>> {
        let tables = self.tables.read().await;
        tables
            .objects
            .get(id)
            .map(|workers| workers.iter().cloned().collect())
            .ok_or_else(|| SchedulerError::StorageBackend(format!("未知的持久化对象: {id}")))
    }

    async fn new_version(
        &self,
        id: &str,
        preserve_source: bool,
        target_worker: &str,
    ) -> SchedulerResult<String> {
        let mut tables = self.tables.write().await;
        if !tables.objects.contains_key(id) {
            return Err(SchedulerError::StorageBackend(format!(
                "未知的持久化对象: {id}"
            )));
        }
        let base = Self::base_id(id).to_string();
        let version = tables.versions.entry(base.clone()).or_insert(0);
        *version += 1;
        let new_id = format!("{base}.v{version}");

        if !preserve_source {
            tables.objects.remove(id);
        }
        tables
            .objects
            .entry(new_id.clone())
            .or_default()
            .insert(target_worker.to_string());
        debug!("持久化对象 {} 生成新版本 {} 于 {}", id, new_id, target_worker);
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_version_moves_object() {
        let storage = InMemoryPersistentStorage::new();
        storage.register("obj", "w1").await;

        let v1 = storage.new_version("obj", false, "w2").await.unwrap();
        assert_eq!(v1, "obj.v1");
        assert!(!storage.contains("obj").await);
        assert_eq!(storage.locations(&v1).await.unwrap(), vec!["w2"]);

        let v2 = storage.new_version(&v1, true, "w1").await.unwrap();
        assert_eq!(v2, "obj.v2");
        assert!(storage.contains(&v1).await);
    }

    #[tokio::test]
    async fn test_unknown_object_is_backend_error() {
        let storage = InMemoryPersistentStorage::new();
        let err = storage.new_version("ghost", false, "w1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::StorageBackend(_)));
        assert!(storage.locations("ghost").await.is_err());
    }
}
