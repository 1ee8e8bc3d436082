use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::{
    observability::ObservabilityConfig,
    resources::{CoreElementConfig, ResourcesConfig, WorkerConfig},
    scheduler::{RuntimeConfig, SchedulerConfig},
};

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub scheduler: SchedulerConfig,
    pub resources: ResourcesConfig,
    pub workers: Vec<WorkerConfig>,
    pub core_elements: Vec<CoreElementConfig>,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: DATAFLOW__, e.g. `DATAFLOW__SCHEDULER__POLICY=fifo`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/runtime.toml", "runtime.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DATAFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.runtime.validate().context("运行时配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.resources.validate().context("弹性资源配置验证失败")?;

        let mut names = HashSet::new();
        for worker in &self.workers {
            worker.validate().context("Worker配置验证失败")?;
            if !names.insert(worker.name.as_str()) {
                return Err(anyhow::anyhow!("Worker名称重复: {}", worker.name));
            }
        }

        for core in &self.core_elements {
            core.validate().context("任务类型配置验证失败")?;
        }

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingPolicyKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.policy, SchedulingPolicyKind::DataLocality);
        assert_eq!(config.scheduler.max_transfer_attempts, 2);
        assert_eq!(config.scheduler.max_job_resubmissions, 2);
        assert_eq!(config.scheduler.max_worker_attempts, 2);
    }

    #[test]
    fn test_duplicate_worker_names_rejected() {
        let toml_str = r#"
[[workers]]
name = "w1"
cpu_cores = 4

[[workers]]
name = "w1"
cpu_cores = 2
"#;
        let err = AppConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("w1"));
    }

    #[test]
    fn test_invalid_vm_bounds_rejected() {
        let mut config = AppConfig::default();
        config.resources.min_vms = 3;
        config.resources.max_vms = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_toml() {
        let mut config = AppConfig::default();
        config.scheduler.policy = SchedulingPolicyKind::Fifo;
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.scheduler.policy, SchedulingPolicyKind::Fifo);
    }
}
