use serde::{Deserialize, Serialize};

use crate::logging::{LogConfig, LogLevel, OutputFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.log_config()?;
        Ok(())
    }

    pub fn log_config(&self) -> anyhow::Result<LogConfig> {
        let level: LogLevel = self
            .log_level
            .parse()
            .map_err(|e| anyhow::anyhow!("无效的日志级别: {e}"))?;
        let format: OutputFormat = self
            .log_format
            .parse()
            .map_err(|e| anyhow::anyhow!("无效的日志格式: {e}"))?;
        Ok(LogConfig::with_level(level).with_format(format))
    }
}
