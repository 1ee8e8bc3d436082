use serde::{Deserialize, Serialize};

/// 弹性资源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub min_vms: u32,
    pub initial_vms: u32,
    pub max_vms: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            min_vms: 0,
            initial_vms: 0,
            max_vms: 0,
        }
    }
}

impl ResourcesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_vms > self.max_vms {
            return Err(anyhow::anyhow!(
                "最小虚拟机数量 {} 大于最大数量 {}",
                self.min_vms,
                self.max_vms
            ));
        }
        if self.initial_vms < self.min_vms || self.initial_vms > self.max_vms {
            return Err(anyhow::anyhow!(
                "初始虚拟机数量 {} 不在 [{}, {}] 范围内",
                self.initial_vms,
                self.min_vms,
                self.max_vms
            ));
        }
        Ok(())
    }
}

/// Worker节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    /// 数据位置使用的主机名，缺省时与名称相同
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_worker_dir")]
    pub working_dir: String,
    pub cpu_cores: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub memory_mb: u64,
    /// 只为该应用执行任务
    #[serde(default)]
    pub app_id: Option<u64>,
    /// 弹性资源（可被回收）
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_worker_dir() -> String {
    "/tmp/dataflow/worker".to_string()
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("Worker名称不能为空"));
        }
        if self.cpu_cores == 0 && self.gpus == 0 {
            return Err(anyhow::anyhow!("Worker {} 没有任何计算资源", self.name));
        }
        if !self.dynamic && self.provider.is_some() {
            return Err(anyhow::anyhow!(
                "静态Worker {} 不能指定云服务提供商",
                self.name
            ));
        }
        Ok(())
    }

    pub fn host_name(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.name)
    }
}

/// 任务类型（核心元素）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreElementConfig {
    pub signature: String,
    pub implementations: Vec<ImplementationConfig>,
}

/// 任务类型的一种实现
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationConfig {
    /// method / binary / mpi / container / service
    pub kind: String,
    /// 方法的完整名称、二进制路径、镜像名或服务端点
    pub target: String,
    #[serde(default = "default_impl_cores")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub memory_mb: u64,
    /// MPI 进程数
    #[serde(default)]
    pub processes: Option<u32>,
}

fn default_impl_cores() -> u32 {
    1
}

impl CoreElementConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signature.is_empty() {
            return Err(anyhow::anyhow!("任务类型签名不能为空"));
        }
        if self.implementations.is_empty() {
            return Err(anyhow::anyhow!("任务类型 {} 没有任何实现", self.signature));
        }
        let valid_kinds = ["method", "binary", "mpi", "container", "service"];
        for implementation in &self.implementations {
            if !valid_kinds.contains(&implementation.kind.as_str()) {
                return Err(anyhow::anyhow!(
                    "无效的实现类型: {}，支持的类型: {:?}",
                    implementation.kind,
                    valid_kinds
                ));
            }
        }
        Ok(())
    }
}
