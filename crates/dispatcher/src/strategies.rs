use dataflow_core::SchedulingPolicyKind;
use dataflow_domain::{ActionId, Implementation, Score, UNUSABLE_RESOURCE_SCORE};
use dataflow_worker::Worker;

use crate::resource_scheduler::ResourceScheduler;

/// 为一个动作在某个Worker上打分所需的上下文
pub struct PlacementContext<'a> {
    pub action_id: ActionId,
    pub priority: bool,
    /// 每个输入参数当前副本所在的主机
    pub input_hosts: &'a [Vec<String>],
    pub worker: &'a Worker,
    pub scheduler: &'a ResourceScheduler,
}

impl PlacementContext<'_> {
    /// 已经驻留在该Worker上的输入数量
    fn resident_inputs(&self) -> i64 {
        self.input_hosts
            .iter()
            .filter(|hosts| {
                hosts
                    .iter()
                    .any(|h| h == self.worker.name() || h == self.worker.host())
            })
            .count() as i64
    }
}

/// 放置策略，分值越大越好
pub trait SchedulingPolicy: Send + Sync {
    fn score(&self, ctx: &PlacementContext<'_>, implementation: &Implementation) -> Score;

    fn name(&self) -> &str;
}

/// 数据本地性优先：输入驻留越多越好，其次阻塞队列越短越好，最后选历史耗时最短的实现
#[derive(Debug, Default)]
pub struct DataLocalityPolicy;

impl SchedulingPolicy for DataLocalityPolicy {
    fn score(&self, ctx: &PlacementContext<'_>, implementation: &Implementation) -> Score {
        let action = i64::from(ctx.priority);
        if !ctx
            .worker
            .description()
            .can_host(&implementation.requirements)
        {
            return Score::new(action, UNUSABLE_RESOURCE_SCORE, 0, 0);
        }
        let profile = ctx
            .scheduler
            .profile(implementation.core_id, implementation.impl_id);
        Score::new(
            action,
            ctx.resident_inputs(),
            -(ctx.scheduler.blocked_len() as i64),
            -(profile.avg_ms as i64),
        )
    }

    fn name(&self) -> &str {
        "DataLocality"
    }
}

/// 先到先得：较早提交的动作分值更高，不考虑数据位置
#[derive(Debug, Default)]
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn score(&self, ctx: &PlacementContext<'_>, implementation: &Implementation) -> Score {
        let action = i64::from(ctx.priority);
        if !ctx
            .worker
            .description()
            .can_host(&implementation.requirements)
        {
            return Score::new(action, UNUSABLE_RESOURCE_SCORE, 0, 0);
        }
        Score::new(
            action,
            -(ctx.action_id as i64),
            -(ctx.scheduler.blocked_len() as i64),
            0,
        )
    }

    fn name(&self) -> &str {
        "Fifo"
    }
}

pub fn policy_for(kind: SchedulingPolicyKind) -> Box<dyn SchedulingPolicy> {
    match kind {
        SchedulingPolicyKind::DataLocality => Box::new(DataLocalityPolicy),
        SchedulingPolicyKind::Fifo => Box::new(FifoPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_domain::{ImplementationKind, ResourceDescription};
    use dataflow_worker::WorkerKind;

    fn implementation(cores: u32) -> Implementation {
        Implementation::new(
            0,
            0,
            "run()",
            ResourceDescription::cores(cores),
            ImplementationKind::Method {
                qualified_name: "Demo.run".into(),
            },
        )
    }

    fn worker(name: &str) -> Worker {
        Worker::new(name, name, ResourceDescription::cores(4), WorkerKind::Static)
    }

    #[test]
    fn test_locality_prefers_worker_holding_inputs() {
        let w1 = worker("w1");
        let w2 = worker("w2");
        let s1 = ResourceScheduler::new("w1", 100);
        let s2 = ResourceScheduler::new("w2", 100);
        let inputs = vec![vec!["w1".to_string()], vec!["w1".to_string(), "master".to_string()]];
        let imp = implementation(1);
        let policy = DataLocalityPolicy;

        let score = |w: &Worker, s: &ResourceScheduler| {
            policy.score(
                &PlacementContext {
                    action_id: 1,
                    priority: false,
                    input_hosts: &inputs,
                    worker: w,
                    scheduler: s,
                },
                &imp,
            )
        };
        let on_w1 = score(&w1, &s1);
        let on_w2 = score(&w2, &s2);
        assert_eq!(on_w1.resource, 2);
        assert_eq!(on_w2.resource, 0);
        assert!(on_w1 > on_w2);
    }

    #[test]
    fn test_shorter_blocked_queue_wins_ties() {
        let w1 = worker("w1");
        let w2 = worker("w2");
        let mut s1 = ResourceScheduler::new("w1", 100);
        s1.block(7, false);
        let s2 = ResourceScheduler::new("w2", 100);
        let imp = implementation(1);
        let policy = DataLocalityPolicy;
        let ctx = |w, s| PlacementContext {
            action_id: 1,
            priority: false,
            input_hosts: &[],
            worker: w,
            scheduler: s,
        };
        assert!(policy.score(&ctx(&w2, &s2), &imp) > policy.score(&ctx(&w1, &s1), &imp));
    }

    #[test]
    fn test_unusable_when_requirements_exceed_capacity() {
        let w1 = worker("w1");
        let s1 = ResourceScheduler::new("w1", 100);
        let ctx = PlacementContext {
            action_id: 1,
            priority: true,
            input_hosts: &[],
            worker: &w1,
            scheduler: &s1,
        };
        let score = DataLocalityPolicy.score(&ctx, &implementation(8));
        assert!(!score.is_usable());
        assert_eq!(score.action, 1);
        assert!(!FifoPolicy.score(&ctx, &implementation(8)).is_usable());
    }

    #[test]
    fn test_fifo_prefers_older_actions() {
        let w1 = worker("w1");
        let s1 = ResourceScheduler::new("w1", 100);
        let ctx = |id| PlacementContext {
            action_id: id,
            priority: false,
            input_hosts: &[],
            worker: &w1,
            scheduler: &s1,
        };
        let imp = implementation(1);
        assert!(FifoPolicy.score(&ctx(1), &imp) > FifoPolicy.score(&ctx(2), &imp));
        assert_eq!(policy_for(SchedulingPolicyKind::Fifo).name(), "Fifo");
    }
}
