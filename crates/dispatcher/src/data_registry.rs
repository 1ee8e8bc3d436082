//! 数据注册表
//!
//! 为文件、内存对象和持久化对象分配数据标识并跟踪每个版本的读者数量和副本位置。

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use dataflow_core::{SchedulerError, SchedulerResult};
use dataflow_domain::{
    AccessMode, DataAccessId, DataId, DataInstance, DataLocation, DataSnapshot, ParameterValue,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DataKey {
    File { host: String, path: String },
    Object(u64),
    Persistent(String),
}

#[derive(Debug, Default)]
struct VersionInfo {
    readers: u32,
    superseded: bool,
    locations: Vec<DataLocation>,
    value: Option<serde_json::Value>,
}

#[derive(Debug)]
struct DataInfo {
    key: DataKey,
    current: u32,
    versions: BTreeMap<u32, VersionInfo>,
}

impl DataInfo {
    fn current_instance(&self, data_id: DataId) -> DataInstance {
        DataInstance::new(data_id, self.current)
    }

    /// 读取当前版本
    fn will_be_read(&mut self, data_id: DataId) -> DataInstance {
        if let Some(version) = self.versions.get_mut(&self.current) {
            version.readers += 1;
        }
        self.current_instance(data_id)
    }

    /// 产生新版本，旧版本在没有读者后释放
    fn will_be_written(&mut self, data_id: DataId) -> DataInstance {
        let previous = self.current;
        if let Some(version) = self.versions.get_mut(&previous) {
            version.superseded = true;
            if version.readers == 0 {
                self.versions.remove(&previous);
            }
        }
        self.current += 1;
        self.versions.insert(self.current, VersionInfo::default());
        self.current_instance(data_id)
    }
}

#[derive(Debug, Default)]
struct RegistryTables {
    next_id: DataId,
    data: HashMap<DataId, DataInfo>,
    by_key: HashMap<DataKey, DataId>,
}

impl RegistryTables {
    fn version_mut(&mut self, instance: DataInstance) -> SchedulerResult<&mut VersionInfo> {
        self.data
            .get_mut(&instance.data_id)
            .and_then(|info| info.versions.get_mut(&instance.version))
            .ok_or(SchedulerError::UnregisteredData {
                id: instance.data_id,
            })
    }

    fn version(&self, instance: DataInstance) -> SchedulerResult<&VersionInfo> {
        self.data
            .get(&instance.data_id)
            .and_then(|info| info.versions.get(&instance.version))
            .ok_or(SchedulerError::UnregisteredData {
                id: instance.data_id,
            })
    }
}

/// 数据注册表，供依赖分析、数据传输和应用读取共用
#[derive(Debug)]
pub struct DataRegistry {
    master: String,
    tables: Mutex<RegistryTables>,
}

impl DataRegistry {
    pub fn new(master: impl Into<String>) -> Self {
        Self {
            master: master.into(),
            tables: Mutex::new(RegistryTables {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    /// 按参数类型注册一次访问
    pub async fn register_access(
        &self,
        value: &ParameterValue,
        mode: AccessMode,
    ) -> SchedulerResult<DataAccessId> {
        match value {
            ParameterValue::File { host, path } => {
                self.register_file_access(mode, host, path).await
            }
            ParameterValue::Object { code, value, .. } => {
                self.register_object_access(mode, *code, value.clone())
                    .await
            }
            ParameterValue::Persistent { id } => self.register_persistent_access(mode, id).await,
            ParameterValue::Basic { .. } | ParameterValue::String { .. } => Err(
                SchedulerError::InvalidTaskParams("基本类型参数不参与数据访问".to_string()),
            ),
        }
    }

    pub async fn register_file_access(
        &self,
        mode: AccessMode,
        host: &str,
        path: &str,
    ) -> SchedulerResult<DataAccessId> {
        let key = DataKey::File {
            host: host.to_string(),
            path: path.to_string(),
        };
        let initial = DataLocation::file(host, path);
        self.register(key, mode, Some(initial), None).await
    }

    pub async fn register_object_access(
        &self,
        mode: AccessMode,
        code: u64,
        value: serde_json::Value,
    ) -> SchedulerResult<DataAccessId> {
        self.register(DataKey::Object(code), mode, None, Some(value))
            .await
    }

    pub async fn register_persistent_access(
        &self,
        mode: AccessMode,
        id: &str,
    ) -> SchedulerResult<DataAccessId> {
        let initial = DataLocation::Persistent { id: id.to_string() };
        self.register(DataKey::Persistent(id.to_string()), mode, Some(initial), None)
            .await
    }

    async fn register(
        &self,
        key: DataKey,
        mode: AccessMode,
        initial_location: Option<DataLocation>,
        initial_value: Option<serde_json::Value>,
    ) -> SchedulerResult<DataAccessId> {
        let mut tables = self.tables.lock().await;
        let existing = tables.by_key.get(&key).copied();
        let data_id = match existing {
            Some(id) => id,
            None => {
                let id = tables.next_id;
                tables.next_id += 1;
                let mut first = VersionInfo::default();
                // 内存对象的初始值保存在主节点
                if initial_value.is_some() {
                    first.locations.push(DataLocation::object(
                        self.master.clone(),
                        DataInstance::new(id, 1).renaming(),
                    ));
                }
                first.locations.extend(initial_location);
                first.value = initial_value;
                let mut versions = BTreeMap::new();
                versions.insert(1, first);
                tables.data.insert(
                    id,
                    DataInfo {
                        key: key.clone(),
                        current: 1,
                        versions,
                    },
                );
                tables.by_key.insert(key, id);
                debug!("注册新数据 d{}", id);
                id
            }
        };

        let info = tables
            .data
            .get_mut(&data_id)
            .ok_or(SchedulerError::UnregisteredData { id: data_id })?;
        Ok(match mode {
            AccessMode::Read => DataAccessId::Read {
                read: info.will_be_read(data_id),
            },
            AccessMode::Write => DataAccessId::Write {
                written: info.will_be_written(data_id),
            },
            AccessMode::ReadWrite => {
                let read = info.will_be_read(data_id);
                let written = info.will_be_written(data_id);
                DataAccessId::ReadWrite { read, written }
            }
        })
    }

    /// 访问结束，读者计数减一，被覆盖且没有读者的版本被释放
    pub async fn data_has_been_accessed(&self, access: &DataAccessId) -> SchedulerResult<()> {
        let Some(read) = access.read_instance() else {
            return Ok(());
        };
        let mut tables = self.tables.lock().await;
        let info = tables
            .data
            .get_mut(&read.data_id)
            .ok_or(SchedulerError::UnregisteredData { id: read.data_id })?;
        let release = match info.versions.get_mut(&read.version) {
            Some(version) => {
                version.readers = version.readers.saturating_sub(1);
                version.readers == 0 && version.superseded
            }
            None => {
                warn!("数据版本 {} 已被释放", read.renaming());
                false
            }
        };
        if release {
            info.versions.remove(&read.version);
            debug!("释放数据版本 {}", read.renaming());
        }
        Ok(())
    }

    pub async fn register_location(
        &self,
        instance: DataInstance,
        location: DataLocation,
    ) -> SchedulerResult<()> {
        let mut tables = self.tables.lock().await;
        let version = tables.version_mut(instance)?;
        if !version.locations.contains(&location) {
            debug!("数据 {} 新增位置 {}", instance, location);
            version.locations.push(location);
        }
        Ok(())
    }

    pub async fn register_value(
        &self,
        instance: DataInstance,
        value: serde_json::Value,
    ) -> SchedulerResult<()> {
        let mut tables = self.tables.lock().await;
        tables.version_mut(instance)?.value = Some(value);
        Ok(())
    }

    pub async fn register_persistent_id(
        &self,
        instance: DataInstance,
        persistent_id: &str,
    ) -> SchedulerResult<()> {
        self.register_location(
            instance,
            DataLocation::Persistent {
                id: persistent_id.to_string(),
            },
        )
        .await
    }

    /// 数据的当前版本
    pub async fn get_data(&self, data_id: DataId) -> SchedulerResult<DataSnapshot> {
        let tables = self.tables.lock().await;
        let info = tables
            .data
            .get(&data_id)
            .ok_or(SchedulerError::UnregisteredData { id: data_id })?;
        let instance = info.current_instance(data_id);
        let version = tables.version(instance)?;
        Ok(DataSnapshot {
            instance,
            locations: version.locations.clone(),
            value: version.value.clone(),
        })
    }

    pub async fn locations(&self, instance: DataInstance) -> SchedulerResult<Vec<DataLocation>> {
        let tables = self.tables.lock().await;
        Ok(tables.version(instance)?.locations.clone())
    }

    /// 持有该版本副本的主机
    pub async fn hosts(&self, instance: DataInstance) -> SchedulerResult<Vec<String>> {
        let locations = self.locations(instance).await?;
        Ok(locations
            .iter()
            .filter_map(|l| l.host().map(String::from))
            .collect())
    }

    /// 参数值对应的数据标识，未注册时返回 `None`
    pub async fn find(&self, value: &ParameterValue) -> Option<DataId> {
        let key = match value {
            ParameterValue::File { host, path } => DataKey::File {
                host: host.clone(),
                path: path.clone(),
            },
            ParameterValue::Object {
                persistent_id: Some(id),
                ..
            } => DataKey::Persistent(id.clone()),
            ParameterValue::Object { code, .. } => DataKey::Object(*code),
            ParameterValue::Persistent { id } => DataKey::Persistent(id.clone()),
            ParameterValue::Basic { .. } | ParameterValue::String { .. } => return None,
        };
        self.tables.lock().await.by_key.get(&key).copied()
    }

    /// 删除文件对应的数据，之后对同一路径的访问视为新数据
    pub async fn delete_file(&self, host: &str, path: &str) -> Option<DataId> {
        let key = DataKey::File {
            host: host.to_string(),
            path: path.to_string(),
        };
        let mut tables = self.tables.lock().await;
        let data_id = tables.by_key.remove(&key)?;
        tables.data.remove(&data_id);
        debug!("删除文件数据 d{} ({}{})", data_id, host, path);
        Some(data_id)
    }

    pub async fn is_file(&self, data_id: DataId) -> bool {
        let tables = self.tables.lock().await;
        tables
            .data
            .get(&data_id)
            .is_some_and(|info| matches!(info.key, DataKey::File { .. }))
    }

    /// 文件数据在应用侧的原始位置
    pub async fn original_location(&self, data_id: DataId) -> Option<DataLocation> {
        let tables = self.tables.lock().await;
        match &tables.data.get(&data_id)?.key {
            DataKey::File { host, path } => Some(DataLocation::file(host.clone(), path.clone())),
            DataKey::Object(_) | DataKey::Persistent(_) => None,
        }
    }

    pub async fn data_count(&self) -> usize {
        self.tables.lock().await.data.len()
    }

    pub async fn version_count(&self, data_id: DataId) -> usize {
        let tables = self.tables.lock().await;
        tables
            .data
            .get(&data_id)
            .map(|info| info.versions.len())
            .unwrap_or(0)
    }
}
