//! 执行动作状态机
//!
//! 一个执行动作对应任务在某个Worker上的一次执行尝试，负责输入传输、作业提交、
//! 完成与失败处理的顺序和重试计数。状态机本身不做任何IO，由运行时引擎根据返回的
//! 决策驱动协作方。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dataflow_core::{SchedulerConfig, SchedulerError};
use dataflow_domain::{
    ActionId, AppId, CoreId, Implementation, JobId, TaskDescription, TaskId, TaskMonitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// 仍有未结束的数据前驱
    Pending,
    /// 等待调度
    Ready,
    /// 没有任何候选Worker，等待资源池变化
    WaitingResources,
    /// 已绑定Worker，在其阻塞队列中等待空闲槽位
    Blocked,
    Scheduled,
    Transferring,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Completed | ActionState::Failed | ActionState::Cancelled
        )
    }
}

/// 重试上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_transfer_attempts: u32,
    pub max_job_resubmissions: u32,
    pub max_worker_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transfer_attempts: 2,
            max_job_resubmissions: 2,
            max_worker_attempts: 2,
        }
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_transfer_attempts: config.max_transfer_attempts,
            max_job_resubmissions: config.max_job_resubmissions,
            max_worker_attempts: config.max_worker_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    /// 来自已经放弃的传输批次
    Stale,
    Waiting,
    Done,
    Failed(TransferDecision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDecision {
    /// 在同一Worker上重新传输
    Retry,
    /// 放弃在该Worker上的尝试
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDecision {
    Resubmit,
    /// 同一Worker上的重试次数已用完
    Reschedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    Reschedule,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker: String,
    pub implementation: Arc<Implementation>,
}

#[derive(Debug, Clone, Copy, Default)]
struct TransferGroup {
    id: u64,
    pending: usize,
    failed: usize,
}

pub struct ExecutionAction {
    id: ActionId,
    task_id: TaskId,
    app_id: AppId,
    description: Arc<TaskDescription>,
    monitor: Arc<dyn TaskMonitor>,
    policy: RetryPolicy,
    state: ActionState,
    /// 强制多重执行时绑定的Worker
    forced_worker: Option<String>,
    assignment: Option<Assignment>,
    /// 已经尝试过的Worker，按尝试顺序
    executing_resources: Vec<String>,
    transfer_errors: u32,
    execution_errors: u32,
    transfer_group: Option<TransferGroup>,
    next_group: u64,
    jobs: Vec<JobId>,
    started_at: Option<Instant>,
}

impl ExecutionAction {
    pub fn new(
        id: ActionId,
        task_id: TaskId,
        app_id: AppId,
        description: Arc<TaskDescription>,
        monitor: Arc<dyn TaskMonitor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            task_id,
            app_id,
            description,
            monitor,
            policy,
            state: ActionState::Pending,
            forced_worker: None,
            assignment: None,
            executing_resources: Vec::new(),
            transfer_errors: 0,
            execution_errors: 0,
            transfer_group: None,
            next_group: 1,
            jobs: Vec::new(),
            started_at: None,
        }
    }

    pub fn pinned_to(mut self, worker: impl Into<String>) -> Self {
        self.forced_worker = Some(worker.into());
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn core_id(&self) -> CoreId {
        self.description.core_id
    }

    pub fn task_name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &Arc<TaskDescription> {
        &self.description
    }

    pub fn monitor(&self) -> &Arc<dyn TaskMonitor> {
        &self.monitor
    }

    pub fn priority(&self) -> bool {
        self.description.priority
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn forced_worker(&self) -> Option<&str> {
        self.forced_worker.as_deref()
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    pub fn assigned_worker(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.worker.as_str())
    }

    pub fn executing_resources(&self) -> &[String] {
        &self.executing_resources
    }

    pub fn has_tried(&self, worker: &str) -> bool {
        self.executing_resources.iter().any(|w| w == worker)
    }

    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.jobs.last().copied()
    }

    pub fn transfer_errors(&self) -> u32 {
        self.transfer_errors
    }

    pub fn execution_errors(&self) -> u32 {
        self.execution_errors
    }

    /// 数据前驱全部结束
    pub fn unblock(&mut self) {
        if self.state == ActionState::Pending {
            self.state = ActionState::Ready;
        }
    }

    pub fn wait_for_resources(&mut self) {
        self.state = ActionState::WaitingResources;
    }

    /// 资源池变化后重新参与调度
    pub fn retry_scheduling(&mut self) {
        if matches!(
            self.state,
            ActionState::WaitingResources | ActionState::Blocked
        ) {
            self.state = ActionState::Ready;
            self.assignment = None;
        }
    }

    /// 绑定到Worker的阻塞队列
    pub fn block_on(&mut self, worker: &str) {
        self.state = ActionState::Blocked;
        self.note_worker(worker);
    }

    fn note_worker(&mut self, worker: &str) {
        if self.executing_resources.last().map(|w| w.as_str()) != Some(worker) {
            self.executing_resources.push(worker.to_string());
            // 计数按Worker独立
            self.transfer_errors = 0;
            self.execution_errors = 0;
        }
    }

    pub fn assign(&mut self, worker: &str, implementation: Arc<Implementation>) {
        self.note_worker(worker);
        self.assignment = Some(Assignment {
            worker: worker.to_string(),
            implementation,
        });
        self.state = ActionState::Scheduled;
    }

    /// 开始一批输入传输，返回批次号
    pub fn start_transfers(&mut self, count: usize) -> u64 {
        let id = self.next_group;
        self.next_group += 1;
        self.transfer_group = Some(TransferGroup {
            id,
            pending: count,
            failed: 0,
        });
        self.state = ActionState::Transferring;
        id
    }

    pub fn on_transfer_result(&mut self, group: u64, succeeded: bool) -> TransferProgress {
        let Some(current) = self.transfer_group.as_mut() else {
            return TransferProgress::Stale;
        };
        if current.id != group || self.state != ActionState::Transferring {
            return TransferProgress::Stale;
        }
        current.pending = current.pending.saturating_sub(1);
        if !succeeded {
            current.failed += 1;
        }
        if current.pending > 0 {
            return TransferProgress::Waiting;
        }
        let failed = current.failed;
        self.transfer_group = None;
        if failed == 0 {
            return TransferProgress::Done;
        }
        self.transfer_errors += 1;
        if self.transfer_errors < self.policy.max_transfer_attempts {
            TransferProgress::Failed(TransferDecision::Retry)
        } else {
            TransferProgress::Failed(TransferDecision::Abandon)
        }
    }

    pub fn job_submitted(&mut self, job_id: JobId) {
        self.jobs.push(job_id);
        self.state = ActionState::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// 当前作业的通知，过期作业的通知返回 false
    pub fn is_current_job(&self, job_id: JobId) -> bool {
        self.state == ActionState::Running && self.current_job() == Some(job_id)
    }

    pub fn on_job_failed(&mut self) -> JobDecision {
        self.execution_errors += 1;
        self.started_at = None;
        if self.execution_errors <= self.policy.max_job_resubmissions {
            JobDecision::Resubmit
        } else {
            JobDecision::Reschedule
        }
    }

    /// 在当前Worker上的尝试失败，决定换Worker还是彻底失败
    pub fn on_error(&mut self, untried_candidates: bool) -> ErrorDecision {
        self.assignment = None;
        self.transfer_group = None;
        self.started_at = None;
        let exhausted = self.executing_resources.len() >= self.policy.max_worker_attempts as usize;
        if exhausted || !untried_candidates || self.forced_worker.is_some() {
            self.state = ActionState::Failed;
            ErrorDecision::Fail
        } else {
            self.state = ActionState::Ready;
            ErrorDecision::Reschedule
        }
    }

    /// 返回本次执行耗时
    pub fn complete(&mut self) -> Duration {
        self.state = ActionState::Completed;
        self.started_at
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn fail(&mut self) {
        self.state = ActionState::Failed;
    }

    pub fn cancel(&mut self) {
        self.state = ActionState::Cancelled;
    }

    /// 彻底失败的诊断信息，列出该任务的所有作业
    pub fn failure_report(&self, all_jobs: &[JobId]) -> SchedulerError {
        let jobs: BTreeSet<JobId> = all_jobs.iter().chain(self.jobs.iter()).copied().collect();
        SchedulerError::TaskFailed {
            task_id: self.task_id,
            name: self.description.name.clone(),
            jobs: jobs.into_iter().collect(),
        }
    }
}

impl fmt::Debug for ExecutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionAction")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("state", &self.state)
            .field("worker", &self.assigned_worker())
            .field("jobs", &self.jobs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_domain::{ImplementationKind, NoopMonitor, ResourceDescription};

    fn action() -> ExecutionAction {
        ExecutionAction::new(
            1,
            10,
            1,
            Arc::new(TaskDescription::new(0, "increment", vec![])),
            Arc::new(NoopMonitor),
            RetryPolicy::default(),
        )
    }

    fn implementation() -> Arc<Implementation> {
        Arc::new(Implementation::new(
            0,
            0,
            "increment()",
            ResourceDescription::cores(1),
            ImplementationKind::Method {
                qualified_name: "Increment.run".into(),
            },
        ))
    }

    #[test]
    fn test_transfer_retry_bound() {
        let mut action = action();
        action.unblock();
        action.assign("w1", implementation());

        let group = action.start_transfers(1);
        assert_eq!(
            action.on_transfer_result(group, false),
            TransferProgress::Failed(TransferDecision::Retry)
        );
        let group = action.start_transfers(1);
        assert_eq!(
            action.on_transfer_result(group, false),
            TransferProgress::Failed(TransferDecision::Abandon)
        );
        assert_eq!(action.transfer_errors(), 2);
    }

    #[test]
    fn test_stale_transfer_notifications_ignored() {
        let mut action = action();
        action.assign("w1", implementation());
        let old = action.start_transfers(2);
        assert_eq!(action.on_transfer_result(old, true), TransferProgress::Waiting);
        let _ = action.on_transfer_result(old, false);
        let new = action.start_transfers(1);
        assert_eq!(action.on_transfer_result(old, true), TransferProgress::Stale);
        assert_eq!(action.on_transfer_result(new, true), TransferProgress::Done);
    }

    #[test]
    fn test_job_resubmission_bound() {
        let mut action = action();
        action.assign("w1", implementation());
        action.job_submitted(1);
        assert_eq!(action.on_job_failed(), JobDecision::Resubmit);
        action.job_submitted(2);
        assert_eq!(action.on_job_failed(), JobDecision::Resubmit);
        action.job_submitted(3);
        assert_eq!(action.on_job_failed(), JobDecision::Reschedule);
        assert_eq!(action.jobs(), &[1, 2, 3]);
    }

    #[test]
    fn test_counters_reset_on_new_worker() {
        let mut action = action();
        action.assign("w1", implementation());
        action.job_submitted(1);
        action.on_job_failed();
        assert_eq!(action.on_error(true), ErrorDecision::Reschedule);

        action.assign("w2", implementation());
        assert_eq!(action.execution_errors(), 0);
        assert_eq!(action.executing_resources(), &["w1".to_string(), "w2".to_string()]);
        // 第二个Worker也失败后达到上限
        assert_eq!(action.on_error(true), ErrorDecision::Fail);
        assert_eq!(action.state(), ActionState::Failed);
    }

    #[test]
    fn test_no_candidates_fails_immediately() {
        let mut action = action();
        action.assign("w1", implementation());
        assert_eq!(action.on_error(false), ErrorDecision::Fail);
    }

    #[test]
    fn test_pinned_action_cannot_move() {
        let mut action = action().pinned_to("w1");
        action.assign("w1", implementation());
        assert_eq!(action.on_error(true), ErrorDecision::Fail);
    }

    #[test]
    fn test_failure_report_lists_jobs() {
        let mut action = action();
        action.assign("w1", implementation());
        action.job_submitted(4);
        action.job_submitted(5);
        let message = action.failure_report(&[2]).to_string();
        assert!(message.contains("increment"));
        assert!(message.contains("job[2|4|5]"));
    }
}
