use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use dataflow_core::{CoreElementConfig, SchedulerError, SchedulerResult};

use crate::models::{CoreId, Implementation};

/// 已注册的任务类型（核心元素）及其实现
#[derive(Debug, Clone, Default)]
pub struct CoreRegistry {
    signatures: Vec<String>,
    implementations: Vec<Vec<Arc<Implementation>>>,
    by_signature: HashMap<String, CoreId>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[CoreElementConfig]) -> SchedulerResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register_from_config(config)?;
        }
        Ok(registry)
    }

    pub fn register_from_config(&mut self, config: &CoreElementConfig) -> SchedulerResult<CoreId> {
        let implementations = config
            .implementations
            .iter()
            .map(|cfg| Implementation::from_config(0, 0, &config.signature, cfg))
            .collect::<SchedulerResult<Vec<_>>>()?;
        Ok(self.register_core_element(&config.signature, implementations))
    }

    /// 注册任务类型，签名已存在时追加实现
    ///
    /// 传入实现的 `core_id`/`impl_id` 会被改写为注册后的值。
    pub fn register_core_element(
        &mut self,
        signature: &str,
        implementations: Vec<Implementation>,
    ) -> CoreId {
        let core_id = match self.by_signature.get(signature) {
            Some(id) => *id,
            None => {
                let id = self.signatures.len();
                self.signatures.push(signature.to_string());
                self.implementations.push(Vec::new());
                self.by_signature.insert(signature.to_string(), id);
                id
            }
        };

        let impls = &mut self.implementations[core_id];
        for mut implementation in implementations {
            implementation.core_id = core_id;
            implementation.impl_id = impls.len();
            impls.push(Arc::new(implementation));
        }
        debug!(
            "注册任务类型 {} (ID: {})，共 {} 个实现",
            signature,
            core_id,
            impls.len()
        );
        core_id
    }

    pub fn core_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn core_ids(&self) -> impl Iterator<Item = CoreId> {
        0..self.signatures.len()
    }

    pub fn find(&self, signature: &str) -> Option<CoreId> {
        self.by_signature.get(signature).copied()
    }

    pub fn signature(&self, core_id: CoreId) -> SchedulerResult<&str> {
        self.signatures
            .get(core_id)
            .map(|s| s.as_str())
            .ok_or(SchedulerError::UnknownCoreElement { id: core_id })
    }

    pub fn implementations(&self, core_id: CoreId) -> SchedulerResult<&[Arc<Implementation>]> {
        self.implementations
            .get(core_id)
            .map(|impls| impls.as_slice())
            .ok_or(SchedulerError::UnknownCoreElement { id: core_id })
    }
}
