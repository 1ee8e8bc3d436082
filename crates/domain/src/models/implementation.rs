use serde::{Deserialize, Serialize};

use dataflow_core::{ImplementationConfig, SchedulerError, SchedulerResult};

use super::{CoreId, ImplId, ResourceDescription};

/// 实现类型及其启动参数
///
/// 调度只关心 [`Implementation::requirements`]，启动参数由作业提交方解释。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImplementationKind {
    Method { qualified_name: String },
    Binary { path: String },
    Mpi { binary: String, processes: u32 },
    Container { image: String },
    Service { endpoint: String },
}

impl ImplementationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ImplementationKind::Method { .. } => "method",
            ImplementationKind::Binary { .. } => "binary",
            ImplementationKind::Mpi { .. } => "mpi",
            ImplementationKind::Container { .. } => "container",
            ImplementationKind::Service { .. } => "service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub core_id: CoreId,
    pub impl_id: ImplId,
    pub signature: String,
    pub requirements: ResourceDescription,
    pub kind: ImplementationKind,
}

impl Implementation {
    pub fn new(
        core_id: CoreId,
        impl_id: ImplId,
        signature: impl Into<String>,
        requirements: ResourceDescription,
        kind: ImplementationKind,
    ) -> Self {
        Self {
            core_id,
            impl_id,
            signature: signature.into(),
            requirements,
            kind,
        }
    }

    pub fn from_config(
        core_id: CoreId,
        impl_id: ImplId,
        signature: &str,
        config: &ImplementationConfig,
    ) -> SchedulerResult<Self> {
        let kind = match config.kind.as_str() {
            "method" => ImplementationKind::Method {
                qualified_name: config.target.clone(),
            },
            "binary" => ImplementationKind::Binary {
                path: config.target.clone(),
            },
            "mpi" => ImplementationKind::Mpi {
                binary: config.target.clone(),
                processes: config.processes.unwrap_or(1),
            },
            "container" => ImplementationKind::Container {
                image: config.target.clone(),
            },
            "service" => ImplementationKind::Service {
                endpoint: config.target.clone(),
            },
            other => {
                return Err(SchedulerError::Configuration(format!(
                    "未知的实现类型: {other}"
                )))
            }
        };
        Ok(Self::new(
            core_id,
            impl_id,
            signature,
            ResourceDescription::new(config.cpu_cores, config.gpus, config.memory_mb),
            kind,
        ))
    }
}
