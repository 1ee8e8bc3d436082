//! 调度请求队列
//!
//! 待放置的动作按任务类型分桶，每个桶内优先任务在前、同优先级按提交顺序。
//! 顶层索引只保存每个桶当前的队首，入队和出队时更新对应桶的队首。

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use dataflow_domain::{ActionId, CoreId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: bool,
    seq: Reverse<ActionId>,
}

impl QueueEntry {
    fn new(action_id: ActionId, priority: bool) -> Self {
        Self {
            priority,
            seq: Reverse(action_id),
        }
    }

    fn action_id(&self) -> ActionId {
        self.seq.0
    }
}

// 越大越先出队
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct SchedulingQueue {
    buckets: BTreeMap<CoreId, BTreeSet<QueueEntry>>,
    heads: BTreeSet<(QueueEntry, CoreId)>,
    index: HashMap<ActionId, (CoreId, QueueEntry)>,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，已在队列中的动作忽略
    pub fn offer(&mut self, action_id: ActionId, core_id: CoreId, priority: bool) -> bool {
        if self.index.contains_key(&action_id) {
            return false;
        }
        let entry = QueueEntry::new(action_id, priority);
        let old_head = self.head_of(core_id);
        self.buckets.entry(core_id).or_default().insert(entry);
        self.index.insert(action_id, (core_id, entry));
        self.refresh_head(core_id, old_head);
        true
    }

    #[cfg(test)]
    fn peek(&self) -> Option<ActionId> {
        self.heads.last().map(|(entry, _)| entry.action_id())
    }

    pub fn poll(&mut self) -> Option<ActionId> {
        let (entry, _) = self.heads.last().copied()?;
        let action_id = entry.action_id();
        self.remove(action_id);
        Some(action_id)
    }

    #[cfg(test)]
    fn peek_core(&self, core_id: CoreId) -> Option<ActionId> {
        self.head_of(core_id).map(|e| e.action_id())
    }

    #[cfg(test)]
    fn poll_core(&mut self, core_id: CoreId) -> Option<ActionId> {
        let action_id = self.peek_core(core_id)?;
        self.remove(action_id);
        Some(action_id)
    }

    pub fn remove(&mut self, action_id: ActionId) -> bool {
        let Some((core_id, entry)) = self.index.remove(&action_id) else {
            return false;
        };
        let old_head = self.head_of(core_id);
        if let Some(bucket) = self.buckets.get_mut(&core_id) {
            bucket.remove(&entry);
            if bucket.is_empty() {
                self.buckets.remove(&core_id);
            }
        }
        self.refresh_head(core_id, old_head);
        true
    }

    #[cfg(test)]
    fn contains(&self, action_id: ActionId) -> bool {
        self.index.contains_key(&action_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[cfg(test)]
    fn len_core(&self, core_id: CoreId) -> usize {
        self.buckets.get(&core_id).map_or(0, |b| b.len())
    }

    /// 按出队顺序列出全部动作，不修改队列
    #[cfg(test)]
    fn ordered(&self) -> Vec<ActionId> {
        let mut entries: Vec<QueueEntry> = self.index.values().map(|(_, e)| *e).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.action_id()).collect()
    }

    fn head_of(&self, core_id: CoreId) -> Option<QueueEntry> {
        self.buckets
            .get(&core_id)
            .and_then(|bucket| bucket.last().copied())
    }

    fn refresh_head(&mut self, core_id: CoreId, old_head: Option<QueueEntry>) {
        let new_head = self.head_of(core_id);
        if old_head == new_head {
            return;
        }
        if let Some(old) = old_head {
            self.heads.remove(&(old, core_id));
        }
        if let Some(new) = new_head {
            self.heads.insert((new, core_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_submission_order() {
        let mut queue = SchedulingQueue::new();
        queue.offer(3, 0, false);
        queue.offer(1, 1, false);
        queue.offer(7, 1, true);
        queue.offer(2, 0, false);

        assert_eq!(queue.ordered(), vec![7, 1, 2, 3]);
        assert_eq!(queue.peek(), Some(7));
        assert_eq!(queue.poll(), Some(7));
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
        assert!(queue.poll().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_core_polling() {
        let mut queue = SchedulingQueue::new();
        queue.offer(1, 0, false);
        queue.offer(2, 1, false);
        queue.offer(3, 1, true);
        assert_eq!(queue.len_core(1), 2);
        assert_eq!(queue.poll_core(1), Some(3));
        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.poll_core(1), Some(2));
        assert!(queue.poll_core(1).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_updates_heads() {
        let mut queue = SchedulingQueue::new();
        queue.offer(1, 0, false);
        queue.offer(2, 0, false);
        assert!(!queue.offer(1, 0, true));
        assert!(queue.remove(1));
        assert!(!queue.contains(1));
        assert_eq!(queue.peek(), Some(2));
        assert!(!queue.remove(1));
    }
}
