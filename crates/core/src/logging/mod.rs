pub mod log_config;
pub mod log_level;

pub use log_config::{LogConfig, OutputFormat};
pub use log_level::LogLevel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{SchedulerError, SchedulerResult};

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先于配置中的级别。
pub fn init_tracing(config: &LogConfig) -> SchedulerResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        OutputFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.include_target),
            )
            .try_init(),
        OutputFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(config.include_target),
            )
            .try_init(),
        OutputFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.include_target),
            )
            .try_init(),
    };

    result.map_err(|e| SchedulerError::Configuration(format!("初始化日志系统失败: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::with_level(LogLevel::Error).with_format(OutputFormat::Json);
        assert_eq!(config.level, LogLevel::Error);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.include_target);
        assert!(!config.with_target(false).include_target);
    }

    #[test]
    fn test_level_display_matches_directive() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
