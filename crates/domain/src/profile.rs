use serde::{Deserialize, Serialize};

/// 某个实现在某个Worker上的历史执行时间（毫秒）
///
/// 仅作为启发式信息使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub executions: u64,
    pub min_ms: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

impl Profile {
    /// 没有历史记录时以 `default_ms` 作为平均值，保证未执行过的组合不会被饿死
    pub fn unset(default_ms: u64) -> Self {
        Self {
            executions: 0,
            min_ms: default_ms,
            avg_ms: default_ms,
            max_ms: default_ms,
        }
    }

    pub fn is_set(&self) -> bool {
        self.executions > 0
    }

    pub fn record(&mut self, elapsed_ms: u64) {
        if self.executions == 0 {
            self.min_ms = elapsed_ms;
            self.avg_ms = elapsed_ms;
            self.max_ms = elapsed_ms;
        } else {
            self.min_ms = self.min_ms.min(elapsed_ms);
            self.max_ms = self.max_ms.max(elapsed_ms);
            let total = self.avg_ms as u128 * self.executions as u128 + elapsed_ms as u128;
            self.avg_ms = (total / (self.executions as u128 + 1)) as u64;
        }
        self.executions += 1;
    }

    /// 合并另一个Worker上的统计
    pub fn accumulate(&mut self, other: &Profile) {
        if !other.is_set() {
            return;
        }
        if !self.is_set() {
            *self = *other;
            return;
        }
        let total = self.avg_ms as u128 * self.executions as u128
            + other.avg_ms as u128 * other.executions as u128;
        self.executions += other.executions;
        self.avg_ms = (total / self.executions as u128) as u64;
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
    }
}
