use serde::{Deserialize, Serialize};

/// 主节点运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 主节点名称，应用侧数据的初始位置
    pub master_name: String,
    /// 主节点工作目录
    pub working_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            master_name: "master".to_string(),
            working_dir: "/tmp/dataflow".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.master_name.is_empty() {
            return Err(anyhow::anyhow!("主节点名称不能为空"));
        }
        if self.working_dir.is_empty() {
            return Err(anyhow::anyhow!("主节点工作目录不能为空"));
        }
        Ok(())
    }
}

/// 评分策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicyKind {
    DataLocality,
    Fifo,
}

/// 调度与容错配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicyKind,
    /// 同一Worker上输入传输的最大尝试次数
    pub max_transfer_attempts: u32,
    /// 作业失败后在同一Worker上重新提交的次数
    pub max_job_resubmissions: u32,
    /// 一个执行动作最多尝试的不同Worker数量
    pub max_worker_attempts: u32,
    /// 没有历史记录时的平均执行时间（毫秒）
    pub default_execution_time_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicyKind::DataLocality,
            max_transfer_attempts: 2,
            max_job_resubmissions: 2,
            max_worker_attempts: 2,
            default_execution_time_ms: 100_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transfer_attempts == 0 {
            return Err(anyhow::anyhow!("输入传输尝试次数必须大于0"));
        }
        if self.max_worker_attempts == 0 {
            return Err(anyhow::anyhow!("Worker尝试次数必须大于0"));
        }
        Ok(())
    }
}
