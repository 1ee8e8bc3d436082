use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dataflow_core::WorkerConfig;
use dataflow_domain::{AppId, CoreId, CoreRegistry, Implementation, ResourceDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerKind {
    Static,
    Dynamic { provider: Option<String> },
}

/// 主节点视角的Worker资源
#[derive(Debug, Clone)]
pub struct Worker {
    name: String,
    host: String,
    working_dir: String,
    kind: WorkerKind,
    description: ResourceDescription,
    available: ResourceDescription,
    app_id: Option<AppId>,
    executable: BTreeMap<CoreId, Vec<Arc<Implementation>>>,
    hosted: usize,
    registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        description: ResourceDescription,
        kind: WorkerKind,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            working_dir: "/tmp/dataflow/worker".to_string(),
            kind,
            description,
            available: description,
            app_id: None,
            executable: BTreeMap::new(),
            hosted: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        let kind = if config.dynamic {
            WorkerKind::Dynamic {
                provider: config.provider.clone(),
            }
        } else {
            WorkerKind::Static
        };
        Self::new(
            config.name.clone(),
            config.host_name(),
            ResourceDescription::new(config.cpu_cores, config.gpus, config.memory_mb),
            kind,
        )
        .with_working_dir(config.working_dir.clone())
        .with_app(config.app_id)
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// 只为指定应用执行任务
    pub fn with_app(mut self, app_id: Option<AppId>) -> Self {
        self.app_id = app_id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, WorkerKind::Dynamic { .. })
    }

    pub fn description(&self) -> &ResourceDescription {
        &self.description
    }

    pub fn available(&self) -> &ResourceDescription {
        &self.available
    }

    pub fn app_id(&self) -> Option<AppId> {
        self.app_id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn accepts_app(&self, app_id: AppId) -> bool {
        self.app_id.map_or(true, |assigned| assigned == app_id)
    }

    /// 按资源总量重新计算可执行的实现
    pub fn update_executable(&mut self, registry: &CoreRegistry) {
        self.executable.clear();
        for core_id in registry.core_ids() {
            let impls: Vec<Arc<Implementation>> = registry
                .implementations(core_id)
                .map(|impls| {
                    impls
                        .iter()
                        .filter(|i| self.description.can_host(&i.requirements))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if !impls.is_empty() {
                self.executable.insert(core_id, impls);
            }
        }
    }

    pub fn can_run(&self, core_id: CoreId) -> bool {
        self.executable.contains_key(&core_id)
    }

    pub fn executable_cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.executable.keys().copied()
    }

    pub fn executable_impls(&self, core_id: CoreId) -> &[Arc<Implementation>] {
        self.executable
            .get(&core_id)
            .map(|impls| impls.as_slice())
            .unwrap_or(&[])
    }

    /// 该任务类型可同时执行的最大数量
    pub fn core_slots(&self, core_id: CoreId) -> usize {
        Self::slots_for(&self.description, self.executable_impls(core_id))
    }

    pub fn all_core_slots(&self) -> BTreeMap<CoreId, usize> {
        self.executable
            .iter()
            .map(|(core, impls)| (*core, Self::slots_for(&self.description, impls)))
            .collect()
    }

    fn slots_for(description: &ResourceDescription, impls: &[Arc<Implementation>]) -> usize {
        impls
            .iter()
            .map(|i| description.times_fits(&i.requirements))
            .max()
            .unwrap_or(0)
    }

    pub fn can_run_now(&self, requirements: &ResourceDescription) -> bool {
        self.available.can_host(requirements)
    }

    pub fn has_free_slots(&self, core_id: CoreId) -> bool {
        self.executable_impls(core_id)
            .iter()
            .any(|i| self.available.can_host(&i.requirements))
    }

    pub fn hosted(&self) -> usize {
        self.hosted
    }

    pub(crate) fn reserve(&mut self, requirements: &ResourceDescription) -> bool {
        if !self.available.can_host(requirements) {
            return false;
        }
        self.available.reduce(requirements);
        self.hosted += 1;
        true
    }

    pub(crate) fn release(&mut self, requirements: &ResourceDescription) {
        self.available.increase(requirements);
        self.available.cpu_cores = self.available.cpu_cores.min(self.description.cpu_cores);
        self.available.gpus = self.available.gpus.min(self.description.gpus);
        self.available.memory_mb = self.available.memory_mb.min(self.description.memory_mb);
        self.hosted = self.hosted.saturating_sub(1);
    }

    pub(crate) fn increase(&mut self, delta: &ResourceDescription) {
        self.description.increase(delta);
        self.available.increase(delta);
    }

    pub(crate) fn reduce(&mut self, delta: &ResourceDescription) {
        self.description.reduce(delta);
        self.available.reduce(delta);
    }

    /// 按给定资源总量计算槽位，用于评估缩容的影响
    pub fn core_slots_with(&self, description: &ResourceDescription) -> BTreeMap<CoreId, usize> {
        self.executable
            .iter()
            .map(|(core, impls)| {
                let slots = impls
                    .iter()
                    .filter(|i| description.can_host(&i.requirements))
                    .map(|i| description.times_fits(&i.requirements))
                    .max()
                    .unwrap_or(0);
                (*core, slots)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_domain::ImplementationKind;

    fn registry() -> CoreRegistry {
        let mut registry = CoreRegistry::new();
        let small = Implementation::new(
            0,
            0,
            "small()",
            ResourceDescription::cores(1),
            ImplementationKind::Method {
                qualified_name: "Small.run".into(),
            },
        );
        let big = Implementation::new(
            0,
            0,
            "big()",
            ResourceDescription::cores(8),
            ImplementationKind::Binary {
                path: "/bin/big".into(),
            },
        );
        registry.register_core_element("small()", vec![small]);
        registry.register_core_element("big()", vec![big]);
        registry
    }

    #[test]
    fn test_executable_follows_capacity() {
        let mut worker = Worker::new("w1", "w1", ResourceDescription::cores(4), WorkerKind::Static);
        worker.update_executable(&registry());
        assert!(worker.can_run(0));
        assert!(!worker.can_run(1));
        assert_eq!(worker.core_slots(0), 4);
    }

    #[test]
    fn test_reserve_and_release() {
        let mut worker = Worker::new("w1", "w1", ResourceDescription::cores(2), WorkerKind::Static);
        worker.update_executable(&registry());
        let req = ResourceDescription::cores(1);
        assert!(worker.reserve(&req));
        assert!(worker.reserve(&req));
        assert!(!worker.has_free_slots(0));
        assert!(!worker.reserve(&req));
        worker.release(&req);
        assert!(worker.has_free_slots(0));
        assert_eq!(worker.hosted(), 1);
    }

    #[test]
    fn test_app_assignment() {
        let worker = Worker::new("w1", "w1", ResourceDescription::cores(1), WorkerKind::Static)
            .with_app(Some(7));
        assert!(worker.accepts_app(7));
        assert!(!worker.accepts_app(8));
    }
}
