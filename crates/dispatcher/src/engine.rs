//! 运行时事件循环
//!
//! 执行动作、每个Worker的调度器和调度请求队列都由事件循环独占。应用请求和协作方通知
//! 都以事件的形式到达，每处理完一个事件后统一进行一轮调度。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use dataflow_core::{CoreElementConfig, SchedulerConfig, SchedulerError, SchedulerResult};
use dataflow_domain::{
    AccessMode, ActionId, AppId, CollaboratorEvent, CollaboratorSender, CoreId, DataInstance,
    DataLocation, DataTransfer, DataType, Implementation, JobDescription, JobHandle, JobId,
    JobListener, JobParameter, JobResult, JobSubmitter, Multiplicity, Parameter, ParameterValue,
    PersistentStorage, ResourceDescription, RuntimeMetrics, Score, TaskDescription, TaskId,
    TaskMonitor, TaskState, TransferListener, TransferReason, TransferRequest,
};
use dataflow_worker::{Worker, WorkerPool, WorkerSet};

use crate::data_registry::DataRegistry;
use crate::dependency_tracker::DependencyTracker;
use crate::events::{Reply, RuntimeEvent};
use crate::execution_action::{
    ActionState, ErrorDecision, ExecutionAction, JobDecision, RetryPolicy, TransferDecision,
    TransferProgress,
};
use crate::resource_scheduler::ResourceScheduler;
use crate::scheduling_queue::SchedulingQueue;
use crate::strategies::{policy_for, PlacementContext, SchedulingPolicy};

/// 外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobSubmitter>,
    pub transfers: Arc<dyn DataTransfer>,
    pub storage: Arc<dyn PersistentStorage>,
    pub metrics: Arc<dyn RuntimeMetrics>,
}

/// 任务在事件循环中的执行记录
struct TaskExecution {
    core_id: CoreId,
    monitor: Arc<dyn TaskMonitor>,
    actions: Vec<ActionId>,
    /// 尚未完成的动作数
    remaining: usize,
    jobs: Vec<JobId>,
    failed: bool,
}

enum Placement {
    Assigned,
    Blocked,
    WaitingResources,
    NoFreeSlots,
    Dropped,
}

pub struct RuntimeEngine {
    config: SchedulerConfig,
    retry: RetryPolicy,
    policy: Box<dyn SchedulingPolicy>,
    tracker: Arc<DependencyTracker>,
    registry: Arc<DataRegistry>,
    pool: Arc<RwLock<WorkerPool>>,
    collaborators: Collaborators,
    collaborator_tx: CollaboratorSender,
    actions: HashMap<ActionId, ExecutionAction>,
    schedulers: HashMap<String, ResourceScheduler>,
    queue: SchedulingQueue,
    waiting_resources: BTreeSet<ActionId>,
    tasks: HashMap<TaskId, TaskExecution>,
    /// 分布式任务每种任务类型的轮询位置
    distribution: HashMap<CoreId, usize>,
    handles: HashMap<JobId, Box<dyn JobHandle>>,
    draining: HashMap<String, Reply<SchedulerResult<()>>>,
    next_action: ActionId,
    next_job: JobId,
    next_group: u64,
    dirty: bool,
}

impl RuntimeEngine {
    pub fn new(
        config: SchedulerConfig,
        tracker: Arc<DependencyTracker>,
        pool: Arc<RwLock<WorkerPool>>,
        collaborators: Collaborators,
        collaborator_tx: CollaboratorSender,
    ) -> Self {
        Self {
            retry: RetryPolicy::from(&config),
            policy: policy_for(config.policy),
            registry: tracker.registry().clone(),
            config,
            tracker,
            pool,
            collaborators,
            collaborator_tx,
            actions: HashMap::new(),
            schedulers: HashMap::new(),
            queue: SchedulingQueue::new(),
            waiting_resources: BTreeSet::new(),
            tasks: HashMap::new(),
            distribution: HashMap::new(),
            handles: HashMap::new(),
            draining: HashMap::new(),
            next_action: 1,
            next_job: 1,
            next_group: 1,
            dirty: false,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
        mut notifications: mpsc::UnboundedReceiver<CollaboratorEvent>,
    ) {
        {
            let pool = self.pool.read().await;
            for worker in pool.workers() {
                self.schedulers.insert(
                    worker.name().to_string(),
                    ResourceScheduler::new(worker.name(), self.config.default_execution_time_ms),
                );
            }
        }
        info!(
            "运行时事件循环启动，调度策略: {}，Worker数量: {}",
            self.policy.name(),
            self.schedulers.len()
        );

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(notification) = notifications.recv() => RuntimeEvent::Collaborator(notification),
            };
            if matches!(event, RuntimeEvent::Shutdown) {
                info!("收到关闭请求");
                break;
            }
            let name = event.name();
            if let Err(e) = self.handle(event).await {
                warn!("处理事件 {} 失败: {}", name, e);
            }
            while self.dirty {
                self.dirty = false;
                self.schedule().await;
            }
            self.publish_gauges();
        }

        for handle in self.handles.values() {
            debug!("停止作业 {}", handle.job_id());
            handle.stop();
        }
        for (_, reply) in self.draining.drain() {
            let _ = reply.send(Err(SchedulerError::ChannelClosed));
        }
        info!("运行时事件循环退出");
    }

    async fn handle(&mut self, event: RuntimeEvent) -> SchedulerResult<()> {
        match event {
            RuntimeEvent::NewTask {
                app_id,
                description,
                monitor,
                reply,
            } => {
                let result = self.new_task(app_id, description, monitor).await;
                let _ = reply.send(result);
            }
            RuntimeEvent::Barrier { app_id, reply } => {
                let _ = reply.send(self.tracker.barrier(app_id).await);
            }
            RuntimeEvent::EndOfApplication { app_id, reply } => {
                info!("应用 {} 结束，不再接受新任务", app_id);
                let _ = reply.send(self.tracker.end_of_application(app_id).await);
            }
            RuntimeEvent::WaitForData {
                data_id,
                mode,
                reply,
            } => {
                let _ = reply.send(self.tracker.wait_for_data(data_id, mode).await);
            }
            RuntimeEvent::DeleteFile { host, path, reply } => {
                let deleted = self.delete_file(&host, &path).await;
                let _ = reply.send(deleted);
            }
            RuntimeEvent::AddWorker { worker, reply } => {
                let result = self.add_worker(worker).await;
                let _ = reply.send(result);
            }
            RuntimeEvent::RemoveWorker { name, reply } => self.remove_worker(name, reply).await,
            RuntimeEvent::ResizeWorker {
                name,
                delta,
                increase,
                reply,
            } => {
                let result = self.resize_worker(&name, &delta, increase).await;
                let _ = reply.send(result);
            }
            RuntimeEvent::RegisterCoreElement { config, reply } => {
                let result = self.register_core_element(config).await;
                let _ = reply.send(result);
            }
            RuntimeEvent::RequestCreation {
                provider,
                description,
                reply,
            } => {
                let result = self
                    .pool
                    .write()
                    .await
                    .request_creation(provider, description);
                let _ = reply.send(result);
            }
            RuntimeEvent::ConfirmCreation {
                request_id,
                worker,
                reply,
            } => {
                let result = self.confirm_creation(request_id, worker).await;
                let _ = reply.send(result);
            }
            RuntimeEvent::CancelCreation { request_id, reply } => {
                let cancelled = self.pool.write().await.cancel_creation(request_id);
                if cancelled {
                    info!("弹性资源创建请求 {} 已取消", request_id);
                }
                let _ = reply.send(cancelled);
            }
            RuntimeEvent::Collaborator(notification) => self.on_notification(notification).await,
            RuntimeEvent::Shutdown => {}
        }
        Ok(())
    }

    // ---- 任务提交 ----

    async fn new_task(
        &mut self,
        app_id: AppId,
        description: TaskDescription,
        monitor: Arc<dyn TaskMonitor>,
    ) -> SchedulerResult<TaskId> {
        let core_id = description.core_id;
        self.pool.read().await.registry().implementations(core_id)?;
        let multiplicity = description.multiplicity();

        let analysed = self
            .tracker
            .new_task(app_id, description, monitor.clone())
            .await?;
        let task = analysed.task;
        let task_id = task.id;
        monitor.on_creation(task_id);
        self.collaborators.metrics.record_task_submitted(core_id);

        let mut execution = TaskExecution {
            core_id,
            monitor: monitor.clone(),
            actions: Vec::new(),
            remaining: 0,
            jobs: Vec::new(),
            failed: false,
        };

        if !analysed.failed_predecessors.is_empty() {
            warn!(
                "任务 {} ({}) 的前驱 {:?} 未成功结束，直接取消",
                task_id,
                task.name(),
                analysed.failed_predecessors
            );
            self.tasks.insert(task_id, execution);
            self.end_tasks(vec![(task_id, TaskState::Canceled)]).await;
            return Ok(task_id);
        }

        let ready = task.predecessors.is_empty();
        let description = Arc::new(task.description);
        let pins = self.forced_targets(app_id, core_id, multiplicity).await;
        let pins: Vec<Option<String>> = if pins.is_empty() {
            vec![None]
        } else {
            pins.into_iter().map(Some).collect()
        };

        for pin in pins {
            let action_id = self.next_action;
            self.next_action += 1;
            let mut action = ExecutionAction::new(
                action_id,
                task_id,
                app_id,
                description.clone(),
                monitor.clone(),
                self.retry,
            );
            if let Some(worker) = pin {
                action = action.pinned_to(worker);
            }
            if ready {
                action.unblock();
                self.queue.offer(action_id, core_id, action.priority());
                self.dirty = true;
            }
            execution.actions.push(action_id);
            self.actions.insert(action_id, action);
        }
        execution.remaining = execution.actions.len();
        debug!(
            "任务 {} ({}) 创建 {} 个执行动作，就绪: {}",
            task_id,
            description.name,
            execution.remaining,
            ready
        );
        self.tasks.insert(task_id, execution);
        Ok(task_id)
    }

    /// 强制多重执行的任务绑定的Worker
    async fn forced_targets(
        &mut self,
        app_id: AppId,
        core_id: CoreId,
        multiplicity: Multiplicity,
    ) -> Vec<String> {
        if multiplicity == Multiplicity::Single {
            return Vec::new();
        }
        let pool = self.pool.read().await;
        let mut compatible: Vec<String> = pool
            .workers()
            .filter(|w| {
                w.can_run(core_id)
                    && w.accepts_app(app_id)
                    && !self.draining.contains_key(w.name())
            })
            .map(|w| w.name().to_string())
            .collect();
        compatible.sort();
        match multiplicity {
            Multiplicity::Single => Vec::new(),
            Multiplicity::Replicated => compatible,
            Multiplicity::Distributed => {
                if compatible.is_empty() {
                    return compatible;
                }
                let cursor = self.distribution.entry(core_id).or_insert(0);
                let pick = compatible[*cursor % compatible.len()].clone();
                *cursor += 1;
                vec![pick]
            }
        }
    }

    // ---- 调度 ----

    async fn schedule(&mut self) {
        let workers: Vec<String> = self
            .schedulers
            .iter()
            .filter(|(_, s)| s.blocked_len() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in workers {
            self.drain_blocked(&name).await;
        }

        let mut deferred = Vec::new();
        while let Some(action_id) = self.queue.poll() {
            match self.place(action_id).await {
                Placement::NoFreeSlots => deferred.push(action_id),
                Placement::Assigned
                | Placement::Blocked
                | Placement::WaitingResources
                | Placement::Dropped => {}
            }
        }
        // 有候选但暂无空闲槽位的动作留在队列中，等待资源释放
        for action_id in deferred {
            if let Some(action) = self.actions.get(&action_id) {
                self.queue
                    .offer(action_id, action.core_id(), action.priority());
            }
        }
    }

    /// 已绑定Worker的动作在该Worker释放槽位后按阻塞队列顺序执行
    async fn drain_blocked(&mut self, name: &str) {
        loop {
            let Some(action_id) = self.schedulers.get(name).and_then(|s| s.peek_blocked()) else {
                break;
            };
            let (priority, core_id, description) = match self.actions.get(&action_id) {
                Some(a) if a.state() == ActionState::Blocked => {
                    (a.priority(), a.core_id(), a.description().clone())
                }
                _ => {
                    self.scheduler_mut(name).pop_blocked();
                    continue;
                }
            };
            let input_hosts = self.input_hosts(&description).await;
            let choice = {
                let pool = self.pool.read().await;
                pool.get(name).and_then(|worker| {
                    self.best_placement(
                        action_id,
                        priority,
                        &input_hosts,
                        std::iter::once(worker),
                        core_id,
                    )
                })
            };
            let Some((_, worker, implementation)) = choice else {
                break;
            };
            self.scheduler_mut(name).pop_blocked();
            if let Placement::NoFreeSlots = self.commit(action_id, &worker, implementation).await {
                self.scheduler_mut(name).block(action_id, priority);
                break;
            }
        }
    }

    async fn place(&mut self, action_id: ActionId) -> Placement {
        let Some(action) = self.actions.get(&action_id) else {
            return Placement::Dropped;
        };
        if action.state() != ActionState::Ready {
            return Placement::Dropped;
        }
        let core_id = action.core_id();
        let app_id = action.app_id();
        let priority = action.priority();
        let forced = action.forced_worker().map(String::from);
        let description = action.description().clone();
        let input_hosts = self.input_hosts(&description).await;

        if let Some(worker) = forced {
            return self
                .place_pinned(action_id, &worker, priority, core_id, &input_hosts)
                .await;
        }

        let choice = {
            let pool = self.pool.read().await;
            let Some(action) = self.actions.get(&action_id) else {
                return Placement::Dropped;
            };
            let candidates: Vec<&Worker> = pool
                .workers()
                .filter(|w| {
                    w.can_run(core_id)
                        && w.accepts_app(app_id)
                        && !action.has_tried(w.name())
                        && !self.draining.contains_key(w.name())
                })
                .collect();
            if candidates.is_empty() {
                None
            } else {
                Some(self.best_placement(
                    action_id,
                    priority,
                    &input_hosts,
                    candidates.into_iter(),
                    core_id,
                ))
            }
        };

        match choice {
            None => {
                debug!("动作 {} 没有候选Worker，等待资源池变化", action_id);
                if let Some(action) = self.actions.get_mut(&action_id) {
                    action.wait_for_resources();
                }
                self.waiting_resources.insert(action_id);
                Placement::WaitingResources
            }
            Some(None) => Placement::NoFreeSlots,
            Some(Some((score, worker, implementation))) => {
                debug!(
                    "动作 {} 选择 {} 上的实现 {}，评分 {}",
                    action_id, worker, implementation.impl_id, score
                );
                self.commit(action_id, &worker, implementation).await
            }
        }
    }

    async fn place_pinned(
        &mut self,
        action_id: ActionId,
        worker: &str,
        priority: bool,
        core_id: CoreId,
        input_hosts: &[Vec<String>],
    ) -> Placement {
        let choice = {
            let pool = self.pool.read().await;
            match pool.get(worker) {
                Some(w) if !self.draining.contains_key(worker) => Ok(self.best_placement(
                    action_id,
                    priority,
                    input_hosts,
                    std::iter::once(w),
                    core_id,
                )),
                _ => Err(()),
            }
        };
        match choice {
            Err(()) => {
                let task_id = self
                    .actions
                    .get(&action_id)
                    .map(|a| a.task_id())
                    .unwrap_or_default();
                warn!("动作 {} 绑定的 Worker {} 已不可用", action_id, worker);
                self.fail_action(action_id, SchedulerError::PlacementExhausted { task_id })
                    .await;
                Placement::Dropped
            }
            Ok(Some((_, worker, implementation))) => {
                self.commit(action_id, &worker, implementation).await
            }
            Ok(None) => {
                if let Some(action) = self.actions.get_mut(&action_id) {
                    action.block_on(worker);
                }
                self.scheduler_mut(worker).block(action_id, priority);
                debug!("动作 {} 进入 {} 的阻塞队列", action_id, worker);
                Placement::Blocked
            }
        }
    }

    /// 在给定Worker中选出当前有空闲资源且评分最高的实现
    fn best_placement<'a>(
        &self,
        action_id: ActionId,
        priority: bool,
        input_hosts: &[Vec<String>],
        workers: impl Iterator<Item = &'a Worker>,
        core_id: CoreId,
    ) -> Option<(Score, String, Arc<Implementation>)> {
        let mut best: Option<(Score, String, Arc<Implementation>)> = None;
        for worker in workers {
            if !worker.has_free_slots(core_id) {
                continue;
            }
            let Some(scheduler) = self.schedulers.get(worker.name()) else {
                continue;
            };
            let ctx = PlacementContext {
                action_id,
                priority,
                input_hosts,
                worker,
                scheduler,
            };
            for implementation in worker.executable_impls(core_id) {
                if !worker.can_run_now(&implementation.requirements) {
                    continue;
                }
                let score = self.policy.score(&ctx, implementation);
                if !score.is_usable() {
                    continue;
                }
                if best.as_ref().map_or(true, |(current, _, _)| score > *current) {
                    best = Some((score, worker.name().to_string(), implementation.clone()));
                }
            }
        }
        best
    }

    async fn commit(
        &mut self,
        action_id: ActionId,
        worker: &str,
        implementation: Arc<Implementation>,
    ) -> Placement {
        if !self.actions.contains_key(&action_id) {
            return Placement::Dropped;
        }
        match self
            .pool
            .write()
            .await
            .reserve(worker, &implementation.requirements)
        {
            Ok(true) => {}
            Ok(false) => return Placement::NoFreeSlots,
            Err(e) => {
                warn!("为动作 {} 预留资源失败: {}", action_id, e);
                return Placement::NoFreeSlots;
            }
        }
        self.scheduler_mut(worker).host(action_id);
        let Some(action) = self.actions.get_mut(&action_id) else {
            return Placement::Dropped;
        };
        action.assign(worker, implementation);
        action.monitor().on_schedule(action.task_id(), worker);
        info!(
            action_id,
            task_id = action.task_id(),
            worker,
            "任务 {} 调度到 {}",
            action.task_name(),
            worker
        );
        self.stage_inputs(action_id).await;
        Placement::Assigned
    }

    /// 每个输入参数当前副本所在的主机
    async fn input_hosts(&self, description: &TaskDescription) -> Vec<Vec<String>> {
        let mut hosts = Vec::new();
        for param in &description.parameters {
            let Some(read) = param.access.and_then(|a| a.read_instance()) else {
                continue;
            };
            let resident = match &param.value {
                ParameterValue::Persistent { id } => {
                    match self.collaborators.storage.locations(id).await {
                        Ok(workers) => workers,
                        Err(e) => {
                            debug!("查询持久化对象 {} 的位置失败: {}", id, e);
                            Vec::new()
                        }
                    }
                }
                _ => self.registry.hosts(read).await.unwrap_or_default(),
            };
            hosts.push(resident);
        }
        hosts
    }

    fn scheduler_mut(&mut self, name: &str) -> &mut ResourceScheduler {
        let default_ms = self.config.default_execution_time_ms;
        self.schedulers
            .entry(name.to_string())
            .or_insert_with(|| ResourceScheduler::new(name, default_ms))
    }

    // ---- 输入传输与作业提交 ----

    async fn worker_location(&self, name: &str) -> Option<(String, String)> {
        let pool = self.pool.read().await;
        pool.get(name)
            .map(|w| (w.host().to_string(), w.working_dir().to_string()))
    }

    async fn stage_inputs(&mut self, action_id: ActionId) {
        let Some(action) = self.actions.get(&action_id) else {
            return;
        };
        let Some(worker) = action.assigned_worker().map(String::from) else {
            return;
        };
        let description = action.description().clone();
        let Some((host, working_dir)) = self.worker_location(&worker).await else {
            self.handle_action_error(action_id, SchedulerError::WorkerNotFound { name: worker })
                .await;
            return;
        };

        let mut requests = Vec::new();
        for param in &description.parameters {
            let Some(read) = param.access.and_then(|a| a.read_instance()) else {
                continue;
            };
            let target = match param.data_type() {
                DataType::File => DataLocation::file(
                    &host,
                    format!("{}/{}", working_dir.trim_end_matches('/'), read.renaming()),
                ),
                DataType::Object => DataLocation::object(&host, read.renaming()),
                // 持久化对象由存储后端访问
                DataType::Persistent | DataType::Basic | DataType::String => continue,
            };
            let locations = match self.registry.locations(read).await {
                Ok(locations) => locations,
                Err(e) => {
                    self.fail_action(action_id, e).await;
                    return;
                }
            };
            if locations
                .iter()
                .any(|l| l.host() == Some(host.as_str()) || l.host() == Some(worker.as_str()))
            {
                debug!("输入 {} 已在 {} 上，无需传输", read, worker);
                continue;
            }
            requests.push(TransferRequest {
                data: read,
                source: locations.first().cloned(),
                target,
                reason: TransferReason::InputStaging,
            });
        }

        if requests.is_empty() {
            self.submit_job(action_id).await;
            return;
        }
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        let group = action.start_transfers(requests.len());
        debug!(
            "动作 {} 向 {} 传输 {} 个输入 (批次 {})",
            action_id,
            worker,
            requests.len(),
            group
        );
        for request in requests {
            let listener = TransferListener::new(Some(action_id), group, self.collaborator_tx.clone());
            if let Err(e) = self
                .collaborators
                .transfers
                .transfer(request.clone(), listener.clone())
                .await
            {
                listener.failed(&request, e.to_string());
            }
        }
    }

    async fn submit_job(&mut self, action_id: ActionId) {
        let Some(action) = self.actions.get(&action_id) else {
            return;
        };
        let Some(assignment) = action.assignment().cloned() else {
            return;
        };
        let description = action.description().clone();
        let task_id = action.task_id();
        let app_id = action.app_id();
        let Some((host, working_dir)) = self.worker_location(&assignment.worker).await else {
            self.handle_action_error(
                action_id,
                SchedulerError::WorkerNotFound {
                    name: assignment.worker,
                },
            )
            .await;
            return;
        };

        let mut parameters = Vec::with_capacity(description.parameters.len());
        for param in &description.parameters {
            let persistent_id = match self.job_persistent_id(param, &assignment.worker).await {
                Ok(id) => id,
                Err(e) => {
                    error!("任务 {} 的持久化对象处理失败: {}", task_id, e);
                    self.fail_action(action_id, e).await;
                    return;
                }
            };
            parameters.push(JobParameter {
                direction: param.direction,
                data_type: param.data_type(),
                renaming: param
                    .access
                    .and_then(|a| a.written_instance().or(a.read_instance()))
                    .map(|instance| instance.renaming()),
                value: match &param.value {
                    ParameterValue::Basic { value } => Some(value.clone()),
                    ParameterValue::String { value } => {
                        Some(serde_json::Value::String(value.clone()))
                    }
                    _ => None,
                },
                persistent_id,
            });
        }

        let job_id = self.next_job;
        self.next_job += 1;
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        action.job_submitted(job_id);
        action.monitor().on_submission(task_id, job_id);
        let task_name = action.task_name().to_string();
        if let Some(execution) = self.tasks.get_mut(&task_id) {
            execution.jobs.push(job_id);
        }
        self.collaborators
            .metrics
            .record_job_submitted(&assignment.worker);
        info!(task_id, job_id, worker = %assignment.worker, "提交作业");

        let job = JobDescription {
            job_id,
            action_id,
            task_id,
            app_id,
            task_name,
            implementation: assignment.implementation,
            worker: assignment.worker,
            host,
            working_dir,
            slaves: Vec::new(),
            parameters,
        };
        let listener = JobListener::new(action_id, job_id, self.collaborator_tx.clone());
        match self.collaborators.jobs.submit(job, listener.clone()).await {
            Ok(handle) => {
                self.handles.insert(job_id, handle);
            }
            Err(e) => {
                warn!("作业 {} 提交失败: {}", job_id, e);
                listener.failed(e.to_string());
            }
        }
    }

    /// 作业使用的持久化对象标识，读写访问先在目标Worker上生成新版本
    async fn job_persistent_id(
        &self,
        param: &Parameter,
        worker: &str,
    ) -> SchedulerResult<Option<String>> {
        let ParameterValue::Persistent { id } = &param.value else {
            return Ok(None);
        };
        let Some(access) = param.access else {
            return Ok(Some(id.clone()));
        };
        let current = match access.read_instance() {
            Some(read) => self
                .current_persistent_id(read)
                .await
                .unwrap_or_else(|| id.clone()),
            None => id.clone(),
        };
        if access.mode() != AccessMode::ReadWrite {
            return Ok(Some(current));
        }
        let new_id = self
            .collaborators
            .storage
            .new_version(&current, false, worker)
            .await?;
        if let Some(written) = access.written_instance() {
            if let Err(e) = self.registry.register_persistent_id(written, &new_id).await {
                debug!("登记持久化对象新版本失败: {}", e);
            }
        }
        debug!("持久化对象 {} 在 {} 上生成新版本 {}", current, worker, new_id);
        Ok(Some(new_id))
    }

    async fn current_persistent_id(&self, instance: DataInstance) -> Option<String> {
        let locations = self.registry.locations(instance).await.ok()?;
        locations.into_iter().rev().find_map(|l| match l {
            DataLocation::Persistent { id } => Some(id),
            _ => None,
        })
    }

    // ---- 协作方通知 ----

    async fn on_notification(&mut self, notification: CollaboratorEvent) {
        match notification {
            CollaboratorEvent::JobCompleted {
                action_id,
                job_id,
                result,
            } => self.on_job_completed(action_id, job_id, result).await,
            CollaboratorEvent::JobFailed {
                action_id,
                job_id,
                reason,
            } => self.on_job_failed(action_id, job_id, reason).await,
            CollaboratorEvent::TransferCompleted {
                action_id,
                group,
                data,
                target,
            } => self.on_transfer_completed(action_id, group, data, target).await,
            CollaboratorEvent::TransferFailed {
                action_id,
                group,
                data,
                reason,
            } => self.on_transfer_failed(action_id, group, data, reason).await,
        }
    }

    async fn on_transfer_completed(
        &mut self,
        action_id: Option<ActionId>,
        group: u64,
        data: DataInstance,
        target: DataLocation,
    ) {
        if let Err(e) = self.registry.register_location(data, target.clone()).await {
            debug!("数据 {} 传输完成时已被释放: {}", data, e);
        }
        let Some(action_id) = action_id else {
            info!("结果文件 {} 已回传到 {}", data, target);
            return;
        };
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        match action.on_transfer_result(group, true) {
            TransferProgress::Done => self.submit_job(action_id).await,
            TransferProgress::Failed(decision) => {
                self.on_transfers_failed(action_id, decision).await
            }
            TransferProgress::Waiting | TransferProgress::Stale => {}
        }
    }

    async fn on_transfer_failed(
        &mut self,
        action_id: Option<ActionId>,
        group: u64,
        data: DataInstance,
        reason: String,
    ) {
        self.collaborators.metrics.record_transfer_failure();
        let Some(action_id) = action_id else {
            warn!("结果文件 {} 回传失败: {}", data, reason);
            return;
        };
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        warn!("动作 {} 的输入 {} 传输失败: {}", action_id, data, reason);
        if let TransferProgress::Failed(decision) = action.on_transfer_result(group, false) {
            self.on_transfers_failed(action_id, decision).await;
        }
    }

    async fn on_transfers_failed(&mut self, action_id: ActionId, decision: TransferDecision) {
        match decision {
            TransferDecision::Retry => {
                info!("重新传输动作 {} 的输入", action_id);
                self.stage_inputs(action_id).await;
            }
            TransferDecision::Abandon => {
                let Some(action) = self.actions.get(&action_id) else {
                    return;
                };
                let task_id = action.task_id();
                let error = SchedulerError::TransferFailed {
                    task_id,
                    worker: action.assigned_worker().unwrap_or_default().to_string(),
                    attempts: action.transfer_errors(),
                };
                action.monitor().on_error_execution(task_id, &error.to_string());
                self.handle_action_error(action_id, error).await;
            }
        }
    }

    async fn on_job_completed(&mut self, action_id: ActionId, job_id: JobId, result: JobResult) {
        self.handles.remove(&job_id);
        let Some(action) = self.actions.get_mut(&action_id) else {
            debug!("动作 {} 已不存在，忽略作业 {} 的完成通知", action_id, job_id);
            return;
        };
        if !action.is_current_job(job_id) {
            debug!("忽略过期作业 {} 的完成通知", job_id);
            return;
        }
        let elapsed = action.complete();
        let Some(assignment) = action.assignment().cloned() else {
            return;
        };
        let task_id = action.task_id();
        let core_id = action.core_id();
        let monitor = action.monitor().clone();
        let description = action.description().clone();

        let elapsed_ms = elapsed.as_millis() as u64;
        let scheduler = self.scheduler_mut(&assignment.worker);
        scheduler.unhost(action_id);
        scheduler.update_profile(core_id, assignment.implementation.impl_id, elapsed_ms);
        self.pool
            .write()
            .await
            .release(&assignment.worker, &assignment.implementation.requirements);
        self.collaborators
            .metrics
            .record_job_duration(core_id, elapsed.as_secs_f64());
        self.dirty = true;
        info!(task_id, job_id, worker = %assignment.worker, elapsed_ms, "作业完成");

        // 输出位置先于任务结束登记
        if self.tasks.contains_key(&task_id) {
            self.register_outputs(&description, &assignment.worker, task_id, &monitor, &result)
                .await;
            monitor.on_successful_execution(task_id);
        }
        self.action_finished(action_id).await;
        self.finish_draining(&assignment.worker).await;
    }

    async fn register_outputs(
        &self,
        description: &TaskDescription,
        worker: &str,
        task_id: TaskId,
        monitor: &Arc<dyn TaskMonitor>,
        result: &JobResult,
    ) {
        let (host, working_dir) = self
            .worker_location(worker)
            .await
            .unwrap_or_else(|| (worker.to_string(), String::new()));
        for (index, param) in description.parameters.iter().enumerate() {
            let Some(written) = param.access.and_then(|a| a.written_instance()) else {
                continue;
            };
            let produced = result.param(index);
            let produced_name = produced.and_then(|p| p.location.clone());
            let location = match param.data_type() {
                DataType::File => DataLocation::file(
                    &host,
                    produced_name.unwrap_or_else(|| {
                        format!("{}/{}", working_dir.trim_end_matches('/'), written.renaming())
                    }),
                ),
                DataType::Object => {
                    DataLocation::object(&host, produced_name.unwrap_or_else(|| written.renaming()))
                }
                DataType::Persistent => {
                    let id = match produced.and_then(|p| p.persistent_id.clone()) {
                        Some(id) => id,
                        None => match self.current_persistent_id(written).await {
                            Some(id) => id,
                            None => match &param.value {
                                ParameterValue::Persistent { id } => id.clone(),
                                _ => continue,
                            },
                        },
                    };
                    DataLocation::Persistent { id }
                }
                DataType::Basic | DataType::String => continue,
            };
            if let Err(e) = self
                .registry
                .register_location(written, location.clone())
                .await
            {
                debug!("输出 {} 已被后续写入取代: {}", written, e);
                continue;
            }
            if let Some(value) = produced.and_then(|p| p.value.clone()) {
                if let Err(e) = self.registry.register_value(written, value).await {
                    debug!("登记输出 {} 的值失败: {}", written, e);
                }
            }
            if param.data_type() == DataType::Object {
                if let Some(id) = produced.and_then(|p| p.persistent_id.as_deref()) {
                    if let Err(e) = self.registry.register_persistent_id(written, id).await {
                        debug!("登记输出 {} 的持久化标识失败: {}", written, e);
                    }
                }
            }
            monitor.on_value_generated(task_id, index, param.data_type(), &location);
        }
    }

    async fn on_job_failed(&mut self, action_id: ActionId, job_id: JobId, reason: String) {
        self.handles.remove(&job_id);
        let Some(action) = self.actions.get(&action_id) else {
            return;
        };
        if !action.is_current_job(job_id) {
            debug!("忽略过期作业 {} 的失败通知", job_id);
            return;
        }
        let task_id = action.task_id();
        let worker = action.assigned_worker().unwrap_or_default().to_string();
        self.collaborators.metrics.record_job_failed(&worker);
        warn!(task_id, job_id, worker = %worker, "作业失败: {}", reason);
        action.monitor().on_error_execution(task_id, &reason);

        if !self.tasks.contains_key(&task_id) {
            // 任务已因其他动作失败而结束
            self.discard_action(action_id).await;
            return;
        }
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        match action.on_job_failed() {
            JobDecision::Resubmit => {
                info!("在 {} 上重新提交任务 {}", worker, task_id);
                self.submit_job(action_id).await;
            }
            JobDecision::Reschedule => {
                self.handle_action_error(
                    action_id,
                    SchedulerError::JobFailed {
                        task_id,
                        job_id,
                        reason,
                    },
                )
                .await;
            }
        }
    }

    // ---- 失败处理 ----

    /// 释放动作在Worker上占用的资源，返回该Worker
    async fn release_action(&mut self, action_id: ActionId) -> Option<String> {
        let action = self.actions.get(&action_id)?;
        if !matches!(
            action.state(),
            ActionState::Scheduled | ActionState::Transferring | ActionState::Running
        ) {
            return None;
        }
        let assignment = action.assignment()?.clone();
        self.scheduler_mut(&assignment.worker).unhost(action_id);
        self.pool
            .write()
            .await
            .release(&assignment.worker, &assignment.implementation.requirements);
        self.dirty = true;
        Some(assignment.worker)
    }

    /// 在当前Worker上的尝试失败：换Worker重新调度或判定任务失败
    async fn handle_action_error(&mut self, action_id: ActionId, cause: SchedulerError) {
        let released = self.release_action(action_id).await;
        let Some(action) = self.actions.get(&action_id) else {
            return;
        };
        let core_id = action.core_id();
        let app_id = action.app_id();
        let untried = {
            let pool = self.pool.read().await;
            let untried = pool.workers().any(|w| {
                w.can_run(core_id)
                    && w.accepts_app(app_id)
                    && !action.has_tried(w.name())
                    && !self.draining.contains_key(w.name())
            });
            untried
        };
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        match action.on_error(untried) {
            ErrorDecision::Reschedule => {
                self.collaborators.metrics.record_reschedule();
                info!("动作 {} 失败 ({})，换Worker重新调度", action_id, cause);
                self.queue.offer(action_id, core_id, action.priority());
                self.dirty = true;
            }
            ErrorDecision::Fail => {
                let task_id = action.task_id();
                self.fail_task(task_id, action_id, cause).await;
            }
        }
        if let Some(worker) = released {
            self.finish_draining(&worker).await;
        }
    }

    /// 不可重试的失败
    async fn fail_action(&mut self, action_id: ActionId, cause: SchedulerError) {
        let released = self.release_action(action_id).await;
        let Some(action) = self.actions.get_mut(&action_id) else {
            return;
        };
        action.fail();
        let task_id = action.task_id();
        self.fail_task(task_id, action_id, cause).await;
        if let Some(worker) = released {
            self.finish_draining(&worker).await;
        }
    }

    async fn fail_task(&mut self, task_id: TaskId, action_id: ActionId, cause: SchedulerError) {
        let Some(execution) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if execution.failed {
            return;
        }
        execution.failed = true;
        let jobs = execution.jobs.clone();
        let core_id = execution.core_id;
        let monitor = execution.monitor.clone();
        let report = match self.actions.get(&action_id) {
            Some(action) => action.failure_report(&jobs),
            None => SchedulerError::TaskFailed {
                task_id,
                name: String::new(),
                jobs,
            },
        };
        error!(task_id, "{}，原因: {}", report, cause);
        monitor.on_failed_execution(task_id, &report);
        self.collaborators.metrics.record_task_failed(core_id);
        self.end_tasks(vec![(task_id, TaskState::Failed)]).await;
    }

    async fn discard_action(&mut self, action_id: ActionId) {
        let released = self.release_action(action_id).await;
        if let Some(mut action) = self.actions.remove(&action_id) {
            action.cancel();
        }
        if let Some(worker) = released {
            self.finish_draining(&worker).await;
        }
    }

    // ---- 任务结束 ----

    async fn action_finished(&mut self, action_id: ActionId) {
        let Some(task_id) = self.actions.get(&action_id).map(|a| a.task_id()) else {
            return;
        };
        let done = match self.tasks.get_mut(&task_id) {
            Some(execution) if !execution.failed => {
                execution.remaining = execution.remaining.saturating_sub(1);
                execution.remaining == 0
            }
            _ => {
                self.actions.remove(&action_id);
                false
            }
        };
        if done {
            self.end_tasks(vec![(task_id, TaskState::Finished)]).await;
        }
    }

    /// 结束任务并级联处理后继：成功时释放就绪的后继，失败时取消所有依赖它的任务
    async fn end_tasks(&mut self, initial: Vec<(TaskId, TaskState)>) {
        let mut work: VecDeque<(TaskId, TaskState)> = initial.into();
        let mut ended = HashSet::new();
        while let Some((task_id, state)) = work.pop_front() {
            if !ended.insert(task_id) {
                continue;
            }
            let report = match self.tracker.end_task(task_id, state).await {
                Ok(report) => report,
                Err(e) => {
                    error!("结束任务 {} 失败: {}", task_id, e);
                    continue;
                }
            };
            if let Some(execution) = self.tasks.remove(&task_id) {
                for action_id in &execution.actions {
                    self.retire_action(*action_id).await;
                }
                if state == TaskState::Finished {
                    self.collaborators
                        .metrics
                        .record_task_completed(execution.core_id);
                }
                execution.monitor.on_completion(task_id);
            }
            debug!(
                "任务 {} 结束 ({:?})，可执行后继 {:?}",
                task_id, state, report.released
            );

            for successor in report.released {
                self.release_task(successor);
            }
            for doomed in report.doomed {
                info!("任务 {} 的前驱 {} 未成功结束，取消", doomed, task_id);
                work.push_back((doomed, TaskState::Canceled));
            }
            for instance in report.result_files {
                self.transfer_result_file(instance).await;
            }
        }
    }

    /// 任务结束后清理其动作，正在运行的作业无法中途取消，完成后再丢弃
    async fn retire_action(&mut self, action_id: ActionId) {
        let Some(state) = self.actions.get(&action_id).map(|a| a.state()) else {
            return;
        };
        match state {
            ActionState::Running => {}
            ActionState::Scheduled | ActionState::Transferring => {
                self.discard_action(action_id).await;
            }
            _ => {
                self.queue.remove(action_id);
                self.waiting_resources.remove(&action_id);
                for scheduler in self.schedulers.values_mut() {
                    scheduler.remove_blocked(action_id);
                }
                if let Some(mut action) = self.actions.remove(&action_id) {
                    if !action.state().is_terminal() {
                        action.cancel();
                    }
                }
            }
        }
    }

    fn release_task(&mut self, task_id: TaskId) {
        let Some(execution) = self.tasks.get(&task_id) else {
            return;
        };
        for action_id in &execution.actions {
            if let Some(action) = self.actions.get_mut(action_id) {
                if action.state() == ActionState::Pending {
                    action.unblock();
                    self.queue
                        .offer(*action_id, action.core_id(), action.priority());
                    self.dirty = true;
                }
            }
        }
    }

    /// 最后写入的结果文件回传到应用侧的原始位置
    async fn transfer_result_file(&mut self, instance: DataInstance) {
        let Some(target) = self.registry.original_location(instance.data_id).await else {
            return;
        };
        let locations = self.registry.locations(instance).await.unwrap_or_default();
        if locations.contains(&target) {
            return;
        }
        let group = self.next_group;
        self.next_group += 1;
        let request = TransferRequest {
            data: instance,
            source: locations.first().cloned(),
            target,
            reason: TransferReason::ResultFile,
        };
        debug!("回传结果文件 {} 到 {}", instance, request.target);
        let listener = TransferListener::new(None, group, self.collaborator_tx.clone());
        if let Err(e) = self
            .collaborators
            .transfers
            .transfer(request.clone(), listener.clone())
            .await
        {
            listener.failed(&request, e.to_string());
        }
    }

    // ---- 资源池变化 ----

    async fn add_worker(&mut self, worker: Worker) -> SchedulerResult<()> {
        let name = worker.name().to_string();
        self.pool.write().await.add_worker(worker)?;
        self.scheduler_mut(&name);
        self.wake_waiting();
        Ok(())
    }

    /// 创建完成的弹性资源加入资源池，等待资源的动作重新参与调度
    async fn confirm_creation(&mut self, request_id: u64, worker: Worker) -> SchedulerResult<()> {
        let name = worker.name().to_string();
        self.pool.write().await.confirm_creation(request_id, worker)?;
        info!("弹性资源创建请求 {} 完成，Worker {} 加入", request_id, name);
        self.scheduler_mut(&name);
        self.wake_waiting();
        Ok(())
    }

    async fn remove_worker(&mut self, name: String, reply: Reply<SchedulerResult<()>>) {
        let (set, min_vms, remaining) = {
            let pool = self.pool.read().await;
            (
                pool.worker_set(&name),
                pool.elastic().limits().min_vms,
                pool.dynamic_count().saturating_sub(self.draining.len()),
            )
        };
        match set {
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
            Ok(WorkerSet::Static | WorkerSet::Critical) => {
                let _ = reply.send(Err(SchedulerError::CriticalWorker { name }));
                return;
            }
            Ok(WorkerSet::NonCritical) => {}
        }
        if self.draining.contains_key(&name) {
            let _ = reply.send(Err(SchedulerError::WorkerBusy { name }));
            return;
        }
        // 排空中的Worker已不计入剩余的动态Worker
        if remaining <= min_vms as usize {
            let _ = reply.send(Err(SchedulerError::ElasticLimit {
                reason: format!("移除 {name} 后动态Worker少于下限 {min_vms}"),
            }));
            return;
        }

        info!("开始排空 Worker {}", name);
        self.draining.insert(name.clone(), reply);
        let blocked = self.scheduler_mut(&name).take_blocked();
        for action_id in blocked {
            if let Some(action) = self.actions.get_mut(&action_id) {
                action.retry_scheduling();
                self.queue
                    .offer(action_id, action.core_id(), action.priority());
            }
        }
        self.dirty = true;
        self.finish_draining(&name).await;
    }

    /// 排空中的Worker没有运行中的动作后从资源池移除
    async fn finish_draining(&mut self, name: &str) {
        if !self.draining.contains_key(name) {
            return;
        }
        if self
            .schedulers
            .get(name)
            .is_some_and(|s| s.running_len() > 0)
        {
            return;
        }
        let Some(reply) = self.draining.remove(name) else {
            return;
        };
        let result = self.pool.write().await.remove_worker(name).map(|_| ());
        match &result {
            Ok(()) => {
                self.schedulers.remove(name);
                info!("Worker {} 已排空并移除", name);
            }
            Err(e) => warn!("移除 Worker {} 失败: {}", name, e),
        }
        let _ = reply.send(result);
    }

    async fn resize_worker(
        &mut self,
        name: &str,
        delta: &ResourceDescription,
        increase: bool,
    ) -> SchedulerResult<()> {
        {
            let mut pool = self.pool.write().await;
            if increase {
                pool.increase_worker(name, delta)?;
            } else {
                pool.reduce_worker(name, delta)?;
            }
        }
        self.wake_waiting();
        Ok(())
    }

    async fn register_core_element(&mut self, config: CoreElementConfig) -> SchedulerResult<CoreId> {
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        let core_id = {
            let mut pool = self.pool.write().await;
            let mut registry = pool.registry().clone();
            let core_id = registry.register_from_config(&config)?;
            pool.update_core_elements(registry);
            core_id
        };
        info!("任务类型 {} 注册为 {}", config.signature, core_id);
        self.wake_waiting();
        Ok(core_id)
    }

    /// 资源池变化后，等待资源的动作重新参与调度
    fn wake_waiting(&mut self) {
        for action_id in std::mem::take(&mut self.waiting_resources) {
            if let Some(action) = self.actions.get_mut(&action_id) {
                action.retry_scheduling();
                self.queue
                    .offer(action_id, action.core_id(), action.priority());
            }
        }
        self.dirty = true;
    }

    async fn delete_file(&mut self, host: &str, path: &str) -> bool {
        let value = ParameterValue::File {
            host: host.to_string(),
            path: path.to_string(),
        };
        let Some(data_id) = self.registry.find(&value).await else {
            return false;
        };
        if !self.tracker.delete_file(data_id).await {
            return false;
        }
        self.registry.delete_file(host, path).await.is_some()
    }

    fn publish_gauges(&self) {
        let metrics = &self.collaborators.metrics;
        metrics.set_pending_actions(self.queue.len() + self.waiting_resources.len());
        metrics.set_blocked_actions(self.schedulers.values().map(|s| s.blocked_len()).sum());
    }
}
