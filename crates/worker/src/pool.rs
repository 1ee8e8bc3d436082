use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use dataflow_core::{AppConfig, ResourcesConfig, SchedulerError, SchedulerResult};
use dataflow_domain::{CoreId, CoreRegistry, ResourceDescription};

use crate::elastic::ElasticCapacity;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSet {
    Static,
    Critical,
    NonCritical,
}

impl fmt::Display for WorkerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerSet::Static => write!(f, "static"),
            WorkerSet::Critical => write!(f, "critical"),
            WorkerSet::NonCritical => write!(f, "non-critical"),
        }
    }
}

/// 资源池状态快照
#[derive(Debug, Clone, Serialize)]
pub struct PoolState {
    pub workers: Vec<(String, WorkerSet, usize)>,
    pub core_slots: BTreeMap<CoreId, usize>,
    pub pending_creations: usize,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Worker池状态:")?;
        for (name, set, hosted) in &self.workers {
            writeln!(f, "  {name} [{set}] 运行中: {hosted}")?;
        }
        for (core, slots) in &self.core_slots {
            writeln!(f, "  任务类型 {core}: {slots} 个槽位")?;
        }
        write!(f, "  待创建资源: {}", self.pending_creations)
    }
}

/// Worker资源池
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: BTreeMap<String, Worker>,
    static_workers: BTreeSet<String>,
    /// 动态Worker按加入顺序排列，关键集合的贪心计算依赖该顺序
    dynamic_order: Vec<String>,
    critical: BTreeSet<String>,
    core_slots: BTreeMap<CoreId, usize>,
    registry: CoreRegistry,
    elastic: ElasticCapacity,
}

impl WorkerPool {
    pub fn new(registry: CoreRegistry, limits: ResourcesConfig) -> Self {
        Self {
            workers: BTreeMap::new(),
            static_workers: BTreeSet::new(),
            dynamic_order: Vec::new(),
            critical: BTreeSet::new(),
            core_slots: BTreeMap::new(),
            registry,
            elastic: ElasticCapacity::new(limits),
        }
    }

    pub fn from_config(config: &AppConfig, registry: CoreRegistry) -> SchedulerResult<Self> {
        let mut pool = Self::new(registry, config.resources.clone());
        for worker_config in &config.workers {
            pool.add_worker(Worker::from_config(worker_config))?;
        }
        Ok(pool)
    }

    pub fn registry(&self) -> &CoreRegistry {
        &self.registry
    }

    pub fn add_worker(&mut self, mut worker: Worker) -> SchedulerResult<()> {
        if self.workers.contains_key(worker.name()) {
            return Err(SchedulerError::Configuration(format!(
                "Worker {} 已存在",
                worker.name()
            )));
        }
        worker.update_executable(&self.registry);
        for (core, slots) in worker.all_core_slots() {
            *self.core_slots.entry(core).or_insert(0) += slots;
        }

        let name = worker.name().to_string();
        let dynamic = worker.is_dynamic();
        self.workers.insert(name.clone(), worker);
        if dynamic {
            self.dynamic_order.push(name.clone());
            self.define_critical_set();
        } else {
            self.static_workers.insert(name.clone());
        }
        info!("Worker {} 加入资源池 (动态: {})", name, dynamic);
        Ok(())
    }

    /// 移除Worker，静态和关键Worker不能移除，动态Worker数量不能低于 `min_vms`
    pub fn remove_worker(&mut self, name: &str) -> SchedulerResult<Worker> {
        match self.worker_set(name)? {
            WorkerSet::NonCritical => {}
            WorkerSet::Static | WorkerSet::Critical => {
                return Err(SchedulerError::CriticalWorker {
                    name: name.to_string(),
                })
            }
        }
        if !self.can_destroy() {
            return Err(SchedulerError::ElasticLimit {
                reason: format!(
                    "移除 {} 后动态Worker少于下限 {}",
                    name,
                    self.elastic.limits().min_vms
                ),
            });
        }
        let worker = self
            .workers
            .remove(name)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                name: name.to_string(),
            })?;
        self.subtract_slots(&worker.all_core_slots());
        self.dynamic_order.retain(|n| n != name);
        self.define_critical_set();
        info!("Worker {} 已从资源池移除", name);
        Ok(worker)
    }

    pub fn increase_worker(&mut self, name: &str, delta: &ResourceDescription) -> SchedulerResult<()> {
        let registry = &self.registry;
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                name: name.to_string(),
            })?;
        let before = worker.all_core_slots();
        worker.increase(delta);
        worker.update_executable(registry);
        let after = worker.all_core_slots();
        self.subtract_slots(&before);
        self.add_slots(&after);
        // 静态Worker扩容后可能覆盖原本只有动态Worker能执行的任务类型
        self.define_critical_set();
        debug!("Worker {} 扩容: {:?}", name, delta);
        Ok(())
    }

    pub fn reduce_worker(&mut self, name: &str, delta: &ResourceDescription) -> SchedulerResult<()> {
        if !self.is_critical_removal_safe(name, delta)? {
            warn!("缩容会导致某些任务类型无法执行，拒绝缩容 Worker {}", name);
            return Err(SchedulerError::CriticalWorker {
                name: name.to_string(),
            });
        }
        let registry = &self.registry;
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                name: name.to_string(),
            })?;
        let before = worker.all_core_slots();
        worker.reduce(delta);
        worker.update_executable(registry);
        let after = worker.all_core_slots();
        self.subtract_slots(&before);
        self.add_slots(&after);
        self.define_critical_set();
        debug!("Worker {} 缩容: {:?}", name, delta);
        Ok(())
    }

    /// 任务类型集合变化后重新计算所有Worker的可执行实现和槽位
    pub fn update_core_elements(&mut self, registry: CoreRegistry) {
        self.registry = registry;
        self.core_slots.clear();
        for worker in self.workers.values_mut() {
            worker.update_executable(&self.registry);
            for (core, slots) in worker.all_core_slots() {
                *self.core_slots.entry(core).or_insert(0) += slots;
            }
        }
        self.define_critical_set();
    }

    fn add_slots(&mut self, slots: &BTreeMap<CoreId, usize>) {
        for (core, count) in slots {
            *self.core_slots.entry(*core).or_insert(0) += count;
        }
    }

    fn subtract_slots(&mut self, slots: &BTreeMap<CoreId, usize>) {
        for (core, count) in slots {
            if let Some(total) = self.core_slots.get_mut(core) {
                *total = total.saturating_sub(*count);
            }
        }
    }

    fn cores_of(&self, name: &str) -> BTreeSet<CoreId> {
        self.workers
            .get(name)
            .map(|w| w.executable_cores().collect())
            .unwrap_or_default()
    }

    fn coverage<'a>(&self, names: impl Iterator<Item = &'a String>) -> BTreeSet<CoreId> {
        names.flat_map(|name| self.cores_of(name)).collect()
    }

    /// 重新划分关键/非关键动态Worker
    ///
    /// 先按加入顺序贪心地选出覆盖所有可执行任务类型的Worker，再逆序剔除多余的Worker，
    /// 保证剩下的每个关键Worker都不可替代。
    pub fn define_critical_set(&mut self) {
        let target = self.coverage(self.workers.keys());
        let mut covered = self.coverage(self.static_workers.iter());

        let mut critical: Vec<String> = Vec::new();
        for name in &self.dynamic_order {
            let cores = self.cores_of(name);
            if !cores.is_subset(&covered) {
                covered.extend(cores);
                critical.push(name.clone());
            }
        }

        let mut index = critical.len();
        while index > 0 {
            index -= 1;
            let others = self
                .static_workers
                .iter()
                .chain(critical.iter().enumerate().filter(|(i, _)| *i != index).map(|(_, n)| n));
            if self.coverage(others).is_superset(&target) {
                critical.remove(index);
            }
        }

        self.critical = critical.into_iter().collect();
        debug!("关键Worker集合: {:?}", self.critical);
    }

    pub fn worker_set(&self, name: &str) -> SchedulerResult<WorkerSet> {
        if !self.workers.contains_key(name) {
            return Err(SchedulerError::WorkerNotFound {
                name: name.to_string(),
            });
        }
        Ok(if self.static_workers.contains(name) {
            WorkerSet::Static
        } else if self.critical.contains(name) {
            WorkerSet::Critical
        } else {
            WorkerSet::NonCritical
        })
    }

    /// 静态与关键Worker能提供的槽位
    fn critical_slots(&self, core_id: CoreId) -> usize {
        self.static_workers
            .iter()
            .chain(self.critical.iter())
            .filter_map(|name| self.workers.get(name))
            .map(|w| w.core_slots(core_id))
            .sum()
    }

    /// 对关键资源的缩减是否安全：涉及的每个任务类型在缩减后仍有剩余槽位
    pub fn is_critical_removal_safe(
        &self,
        name: &str,
        reduction: &ResourceDescription,
    ) -> SchedulerResult<bool> {
        if self.worker_set(name)? == WorkerSet::NonCritical {
            return Ok(true);
        }
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                name: name.to_string(),
            })?;
        let mut reduced = *worker.description();
        reduced.reduce(reduction);
        let after = worker.core_slots_with(&reduced);
        for (core, before) in worker.all_core_slots() {
            let lost = before.saturating_sub(after.get(&core).copied().unwrap_or(0));
            if lost > 0 && self.critical_slots(core) <= lost {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 当前槽位加上待创建资源的预期槽位
    pub fn total_slots(&self, core_id: CoreId) -> usize {
        self.core_slots.get(&core_id).copied().unwrap_or(0) + self.elastic.pending_slots(core_id)
    }

    pub fn current_slots(&self, core_id: CoreId) -> usize {
        self.core_slots.get(&core_id).copied().unwrap_or(0)
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic_order.len()
    }

    pub fn can_request_creation(&self) -> bool {
        self.elastic.can_request_creation(self.dynamic_count())
    }

    pub fn can_destroy(&self) -> bool {
        self.elastic.can_destroy(self.dynamic_count())
    }

    pub fn request_creation(
        &mut self,
        provider: Option<String>,
        description: ResourceDescription,
    ) -> SchedulerResult<u64> {
        if !self.can_request_creation() {
            return Err(SchedulerError::ElasticLimit {
                reason: format!("已达到上限 {}", self.elastic.limits().max_vms),
            });
        }
        let mut template = Worker::new("", "", description, crate::WorkerKind::Static);
        template.update_executable(&self.registry);
        let request_id = self
            .elastic
            .add_request(provider, description, template.all_core_slots());
        info!("发出弹性资源创建请求 {}", request_id);
        Ok(request_id)
    }

    /// 创建完成，资源以动态Worker身份加入
    pub fn confirm_creation(&mut self, request_id: u64, worker: Worker) -> SchedulerResult<()> {
        if !self.elastic.pending().any(|p| p.request_id == request_id) {
            return Err(SchedulerError::Internal(format!(
                "未知的创建请求: {request_id}"
            )));
        }
        if !worker.is_dynamic() {
            return Err(SchedulerError::Configuration(format!(
                "弹性资源 {} 必须以动态Worker加入",
                worker.name()
            )));
        }
        self.add_worker(worker)?;
        self.elastic.take_request(request_id);
        Ok(())
    }

    pub fn cancel_creation(&mut self, request_id: u64) -> bool {
        self.elastic.take_request(request_id).is_some()
    }

    pub fn elastic(&self) -> &ElasticCapacity {
        &self.elastic
    }

    pub fn get(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn critical_workers(&self) -> impl Iterator<Item = &str> {
        self.critical.iter().map(|s| s.as_str())
    }

    pub fn non_critical_workers(&self) -> impl Iterator<Item = &str> {
        self.dynamic_order
            .iter()
            .filter(|name| !self.critical.contains(*name))
            .map(|s| s.as_str())
    }

    /// 在Worker上为一个动作预留资源
    pub fn reserve(&mut self, name: &str, requirements: &ResourceDescription) -> SchedulerResult<bool> {
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                name: name.to_string(),
            })?;
        Ok(worker.reserve(requirements))
    }

    pub fn release(&mut self, name: &str, requirements: &ResourceDescription) {
        match self.workers.get_mut(name) {
            Some(worker) => worker.release(requirements),
            None => debug!("释放资源时Worker {} 已不在资源池中", name),
        }
    }

    pub fn state(&self) -> PoolState {
        let workers = self
            .workers
            .values()
            .map(|w| {
                let set = self.worker_set(w.name()).unwrap_or(WorkerSet::NonCritical);
                (w.name().to_string(), set, w.hosted())
            })
            .collect();
        PoolState {
            workers,
            core_slots: self.core_slots.clone(),
            pending_creations: self.elastic.pending_count(),
        }
    }
}
