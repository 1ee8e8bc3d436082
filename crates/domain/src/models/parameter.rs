use serde::{Deserialize, Serialize};

use super::{AccessMode, DataAccessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn access_mode(&self) -> AccessMode {
        match self {
            Direction::In => AccessMode::Read,
            Direction::Out => AccessMode::Write,
            Direction::InOut => AccessMode::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    File,
    Object,
    Persistent,
    Basic,
    String,
}

/// 参数携带的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterValue {
    /// 应用侧文件的原始位置
    File { host: String, path: String },
    /// 内存对象，`code` 为应用侧的对象标识
    Object {
        code: u64,
        value: serde_json::Value,
        /// 对象已经持久化到存储后端时的标识
        persistent_id: Option<String>,
    },
    Persistent { id: String },
    Basic { value: serde_json::Value },
    String { value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub direction: Direction,
    pub value: ParameterValue,
    /// 依赖分析后填充
    pub access: Option<DataAccessId>,
}

impl Parameter {
    pub fn file(direction: Direction, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            direction,
            value: ParameterValue::File {
                host: host.into(),
                path: path.into(),
            },
            access: None,
        }
    }

    pub fn object(direction: Direction, code: u64, value: serde_json::Value) -> Self {
        Self {
            direction,
            value: ParameterValue::Object {
                code,
                value,
                persistent_id: None,
            },
            access: None,
        }
    }

    pub fn persistent(direction: Direction, id: impl Into<String>) -> Self {
        Self {
            direction,
            value: ParameterValue::Persistent { id: id.into() },
            access: None,
        }
    }

    /// 基本类型只读
    pub fn basic(value: serde_json::Value) -> Self {
        Self {
            direction: Direction::In,
            value: ParameterValue::Basic { value },
            access: None,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            direction: Direction::In,
            value: ParameterValue::String {
                value: value.into(),
            },
            access: None,
        }
    }

    pub fn data_type(&self) -> DataType {
        match &self.value {
            ParameterValue::File { .. } => DataType::File,
            ParameterValue::Object { .. } => DataType::Object,
            ParameterValue::Persistent { .. } => DataType::Persistent,
            ParameterValue::Basic { .. } => DataType::Basic,
            ParameterValue::String { .. } => DataType::String,
        }
    }

    /// 是否参与依赖分析
    pub fn is_dependency(&self) -> bool {
        matches!(
            self.data_type(),
            DataType::File | DataType::Object | DataType::Persistent
        )
    }

    /// 已持久化的对象按持久化对象处理，返回是否发生了转换
    pub fn reclassify_persistent(&mut self) -> bool {
        if let ParameterValue::Object {
            persistent_id: Some(id),
            ..
        } = &self.value
        {
            self.value = ParameterValue::Persistent { id: id.clone() };
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_parameters_are_not_dependencies() {
        assert!(!Parameter::basic(json!(3)).is_dependency());
        assert!(!Parameter::string("x").is_dependency());
        assert!(Parameter::file(Direction::In, "master", "/a.txt").is_dependency());
    }

    #[test]
    fn test_reclassify_persisted_object() {
        let mut param = Parameter::object(Direction::InOut, 5, json!({"k": 1}));
        assert!(!param.reclassify_persistent());

        if let ParameterValue::Object { persistent_id, .. } = &mut param.value {
            *persistent_id = Some("psco-1".to_string());
        }
        assert!(param.reclassify_persistent());
        assert_eq!(param.data_type(), DataType::Persistent);
        assert_eq!(param.direction, Direction::InOut);
    }
}
