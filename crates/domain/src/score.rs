use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 资源不可能满足实现需求时使用的分值
pub const UNUSABLE_RESOURCE_SCORE: i64 = -(i32::MAX as i64);

/// 放置评分，按字段顺序逐项比较，越大越好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Score {
    pub action: i64,
    pub resource: i64,
    pub waiting: i64,
    pub implementation: i64,
}

impl Score {
    pub fn new(action: i64, resource: i64, waiting: i64, implementation: i64) -> Self {
        Self {
            action,
            resource,
            waiting,
            implementation,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.resource > UNUSABLE_RESOURCE_SCORE
    }

    fn as_tuple(&self) -> (i64, i64, i64, i64) {
        (self.action, self.resource, self.waiting, self.implementation)
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.action, self.resource, self.waiting, self.implementation
        )
    }
}
