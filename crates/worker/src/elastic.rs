use std::collections::BTreeMap;

use dataflow_core::ResourcesConfig;
use dataflow_domain::{CoreId, ResourceDescription};

/// 已发出但尚未完成的弹性资源创建请求
#[derive(Debug, Clone)]
pub struct PendingCreation {
    pub request_id: u64,
    pub provider: Option<String>,
    pub description: ResourceDescription,
    /// 创建完成后预计提供的槽位
    pub core_slots: BTreeMap<CoreId, usize>,
}

/// 弹性资源的数量限制与待创建请求
#[derive(Debug, Clone)]
pub struct ElasticCapacity {
    limits: ResourcesConfig,
    pending: BTreeMap<u64, PendingCreation>,
    next_request: u64,
}

impl ElasticCapacity {
    pub fn new(limits: ResourcesConfig) -> Self {
        Self {
            limits,
            pending: BTreeMap::new(),
            next_request: 1,
        }
    }

    pub fn limits(&self) -> &ResourcesConfig {
        &self.limits
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingCreation> {
        self.pending.values()
    }

    pub fn pending_slots(&self, core_id: CoreId) -> usize {
        self.pending
            .values()
            .filter_map(|p| p.core_slots.get(&core_id))
            .sum()
    }

    pub fn can_request_creation(&self, dynamic_workers: usize) -> bool {
        (dynamic_workers + self.pending.len()) < self.limits.max_vms as usize
    }

    pub fn can_destroy(&self, dynamic_workers: usize) -> bool {
        dynamic_workers > self.limits.min_vms as usize
    }

    pub(crate) fn add_request(
        &mut self,
        provider: Option<String>,
        description: ResourceDescription,
        core_slots: BTreeMap<CoreId, usize>,
    ) -> u64 {
        let request_id = self.next_request;
        self.next_request += 1;
        self.pending.insert(
            request_id,
            PendingCreation {
                request_id,
                provider,
                description,
                core_slots,
            },
        );
        request_id
    }

    pub(crate) fn take_request(&mut self, request_id: u64) -> Option<PendingCreation> {
        self.pending.remove(&request_id)
    }
}
