use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use tracing::trace;

use dataflow_domain::{ActionId, CoreId, ImplId, Profile};

/// 阻塞队列中的条目：优先任务在前，同优先级按提交顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockedEntry {
    priority: bool,
    seq: Reverse<ActionId>,
}

impl Ord for BlockedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for BlockedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 单个Worker上的调度状态：正在运行的动作、等待槽位的阻塞队列和执行耗时画像
#[derive(Debug)]
pub struct ResourceScheduler {
    name: String,
    running: BTreeSet<ActionId>,
    blocked: BinaryHeap<BlockedEntry>,
    profiles: HashMap<(CoreId, ImplId), Profile>,
    default_execution_ms: u64,
}

impl ResourceScheduler {
    pub fn new(name: impl Into<String>, default_execution_ms: u64) -> Self {
        Self {
            name: name.into(),
            running: BTreeSet::new(),
            blocked: BinaryHeap::new(),
            profiles: HashMap::new(),
            default_execution_ms,
        }
    }

    pub fn host(&mut self, action_id: ActionId) {
        self.running.insert(action_id);
    }

    pub fn unhost(&mut self, action_id: ActionId) -> bool {
        self.running.remove(&action_id)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn block(&mut self, action_id: ActionId, priority: bool) {
        self.blocked.push(BlockedEntry {
            priority,
            seq: Reverse(action_id),
        });
    }

    pub fn peek_blocked(&self) -> Option<ActionId> {
        self.blocked.peek().map(|e| e.seq.0)
    }

    pub fn pop_blocked(&mut self) -> Option<ActionId> {
        self.blocked.pop().map(|e| e.seq.0)
    }

    /// 清空阻塞队列，按出队顺序返回
    pub fn take_blocked(&mut self) -> Vec<ActionId> {
        let mut drained = Vec::with_capacity(self.blocked.len());
        while let Some(entry) = self.blocked.pop() {
            drained.push(entry.seq.0);
        }
        drained
    }

    pub fn remove_blocked(&mut self, action_id: ActionId) -> bool {
        let before = self.blocked.len();
        self.blocked.retain(|e| e.seq.0 != action_id);
        before != self.blocked.len()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.blocked.is_empty()
    }

    /// 未有执行记录时返回以默认耗时初始化的画像
    pub fn profile(&self, core_id: CoreId, impl_id: ImplId) -> Profile {
        self.profiles
            .get(&(core_id, impl_id))
            .copied()
            .unwrap_or_else(|| Profile::unset(self.default_execution_ms))
    }

    pub fn update_profile(&mut self, core_id: CoreId, impl_id: ImplId, elapsed_ms: u64) {
        trace!(
            "{} 上任务类型 {} 实现 {} 耗时 {}ms",
            self.name,
            core_id,
            impl_id,
            elapsed_ms
        );
        let default_ms = self.default_execution_ms;
        self.profiles
            .entry((core_id, impl_id))
            .or_insert_with(|| Profile::unset(default_ms))
            .record(elapsed_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_queue_order() {
        let mut scheduler = ResourceScheduler::new("w1", 100);
        scheduler.block(5, false);
        scheduler.block(3, false);
        scheduler.block(9, true);
        assert_eq!(scheduler.peek_blocked(), Some(9));
        assert_eq!(scheduler.take_blocked(), vec![9, 3, 5]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_remove_blocked() {
        let mut scheduler = ResourceScheduler::new("w1", 100);
        scheduler.block(1, false);
        scheduler.block(2, false);
        assert!(scheduler.remove_blocked(1));
        assert!(!scheduler.remove_blocked(1));
        assert_eq!(scheduler.pop_blocked(), Some(2));
    }

    #[test]
    fn test_profile_defaults_and_updates() {
        let mut scheduler = ResourceScheduler::new("w1", 100);
        assert!(!scheduler.profile(0, 0).is_set());
        scheduler.update_profile(0, 0, 40);
        scheduler.update_profile(0, 0, 20);
        let profile = scheduler.profile(0, 0);
        assert_eq!(profile.executions, 2);
        assert_eq!(profile.avg_ms, 30);
        assert_eq!(profile.min_ms, 20);
    }
}
