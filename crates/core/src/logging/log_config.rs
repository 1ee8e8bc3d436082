use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

use super::LogLevel;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    /// 单行紧凑格式
    Text,
    Pretty,
}

impl FromStr for OutputFormat {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" | "compact" => Ok(OutputFormat::Text),
            "pretty" => Ok(OutputFormat::Pretty),
            _ => Err(SchedulerError::Configuration(format!(
                "无效的日志格式: {raw}"
            ))),
        }
    }
}

/// 日志系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: OutputFormat,
    /// 是否输出事件所在模块
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: OutputFormat::Pretty,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// 从 `LOG_LEVEL`、`LOG_FORMAT`、`LOG_TARGET` 读取，缺省项取默认值
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: LogLevel::from_env(),
            format: std::env::var("LOG_FORMAT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.format),
            include_target: std::env::var("LOG_TARGET")
                .map(|raw| raw.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.include_target),
        }
    }

    pub fn with_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_target(mut self, include_target: bool) -> Self {
        self.include_target = include_target;
        self
    }
}
