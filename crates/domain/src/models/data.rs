use std::fmt;

use serde::{Deserialize, Serialize};

use super::DataId;

/// 数据的某个具体版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataInstance {
    pub data_id: DataId,
    pub version: u32,
}

impl DataInstance {
    pub fn new(data_id: DataId, version: u32) -> Self {
        Self { data_id, version }
    }

    /// 该版本在远端节点上使用的名称
    pub fn renaming(&self) -> String {
        format!("d{}v{}", self.data_id, self.version)
    }
}

impl fmt::Display for DataInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.renaming())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn reads(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// 一次数据访问解析出的版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataAccessId {
    Read {
        read: DataInstance,
    },
    Write {
        written: DataInstance,
    },
    ReadWrite {
        read: DataInstance,
        written: DataInstance,
    },
}

impl DataAccessId {
    pub fn data_id(&self) -> DataId {
        match self {
            DataAccessId::Read { read } => read.data_id,
            DataAccessId::Write { written } => written.data_id,
            DataAccessId::ReadWrite { read, .. } => read.data_id,
        }
    }

    pub fn mode(&self) -> AccessMode {
        match self {
            DataAccessId::Read { .. } => AccessMode::Read,
            DataAccessId::Write { .. } => AccessMode::Write,
            DataAccessId::ReadWrite { .. } => AccessMode::ReadWrite,
        }
    }

    pub fn read_instance(&self) -> Option<DataInstance> {
        match self {
            DataAccessId::Read { read } | DataAccessId::ReadWrite { read, .. } => Some(*read),
            DataAccessId::Write { .. } => None,
        }
    }

    pub fn written_instance(&self) -> Option<DataInstance> {
        match self {
            DataAccessId::Write { written } | DataAccessId::ReadWrite { written, .. } => {
                Some(*written)
            }
            DataAccessId::Read { .. } => None,
        }
    }
}

/// 数据副本所在的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataLocation {
    File { host: String, path: String },
    Object { host: String, name: String },
    Persistent { id: String },
}

impl DataLocation {
    pub fn file(host: impl Into<String>, path: impl Into<String>) -> Self {
        DataLocation::File {
            host: host.into(),
            path: path.into(),
        }
    }

    pub fn object(host: impl Into<String>, name: impl Into<String>) -> Self {
        DataLocation::Object {
            host: host.into(),
            name: name.into(),
        }
    }

    /// 持久化对象的位置由存储后端解析，没有固定主机
    pub fn host(&self) -> Option<&str> {
        match self {
            DataLocation::File { host, .. } | DataLocation::Object { host, .. } => Some(host),
            DataLocation::Persistent { .. } => None,
        }
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLocation::File { host, path } => write!(f, "file://{host}{path}"),
            DataLocation::Object { host, name } => write!(f, "object://{host}/{name}"),
            DataLocation::Persistent { id } => write!(f, "storage://{id}"),
        }
    }
}

/// `get_data` 返回的当前值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub instance: DataInstance,
    pub locations: Vec<DataLocation>,
    pub value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renaming_format() {
        assert_eq!(DataInstance::new(12, 3).renaming(), "d12v3");
    }

    #[test]
    fn test_access_instances() {
        let read = DataInstance::new(1, 1);
        let written = DataInstance::new(1, 2);
        let access = DataAccessId::ReadWrite { read, written };
        assert_eq!(access.read_instance(), Some(read));
        assert_eq!(access.written_instance(), Some(written));
        assert_eq!(access.mode(), AccessMode::ReadWrite);

        let write_only = DataAccessId::Write { written };
        assert!(write_only.read_instance().is_none());
    }

    #[test]
    fn test_location_uri() {
        let loc = DataLocation::file("w1", "/tmp/d1v1");
        assert_eq!(loc.to_string(), "file://w1/tmp/d1v1");
        assert_eq!(loc.host(), Some("w1"));
        assert!(DataLocation::Persistent { id: "p1".into() }.host().is_none());
    }
}
