//! 依赖跟踪
//!
//! 把提交的任务转换为数据流图：读访问依赖数据的最后写者，写访问把当前任务登记为
//! 新的最后写者。同时维护每个应用的任务计数，用于屏障和应用结束的同步。
//!
//! 各张表分别加锁，需要同时持有多把锁时按 应用 -> 任务 -> 写者 -> 数据等待 的顺序获取。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use dataflow_core::{SchedulerError, SchedulerResult};
use dataflow_domain::{
    AccessMode, AppId, CoreId, DataId, DataInstance, DataType, Direction, Task, TaskDescription,
    TaskId, TaskMonitor, TaskState,
};

use crate::data_registry::DataRegistry;

/// 屏障、应用结束和数据等待的阻塞句柄
pub type SyncReceiver = oneshot::Receiver<SchedulerResult<()>>;
type SyncSender = oneshot::Sender<SchedulerResult<()>>;

#[derive(Debug, Default)]
struct AppState {
    live: usize,
    total: usize,
    completed: usize,
    canceled: usize,
    closed: bool,
    failed: Vec<TaskId>,
    sync_waiters: Vec<SyncSender>,
    written_files: BTreeSet<DataId>,
}

impl AppState {
    fn sync_result(&self, app_id: AppId) -> SchedulerResult<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::ApplicationFailed {
                app_id,
                failed_tasks: self.failed.clone(),
            })
        }
    }
}

/// 数据 -> 最后写者
#[derive(Debug, Default)]
struct WriterTable {
    last: HashMap<DataId, TaskId>,
    /// 每个任务仍作为最后写者的数据数量
    held: HashMap<TaskId, usize>,
}

impl WriterTable {
    /// 登记新的写者，返回被取代的写者
    fn set(&mut self, data_id: DataId, task_id: TaskId) -> Option<TaskId> {
        let previous = self.last.insert(data_id, task_id);
        if previous == Some(task_id) {
            return None;
        }
        *self.held.entry(task_id).or_insert(0) += 1;
        previous.inspect(|prev| self.release(*prev))
    }

    fn clear(&mut self, data_id: DataId) -> Option<TaskId> {
        let previous = self.last.remove(&data_id);
        previous.inspect(|prev| self.release(*prev))
    }

    fn release(&mut self, task_id: TaskId) {
        if let Some(count) = self.held.get_mut(&task_id) {
            *count -= 1;
            if *count == 0 {
                self.held.remove(&task_id);
            }
        }
    }

    fn holds(&self, task_id: TaskId) -> bool {
        self.held.contains_key(&task_id)
    }
}

/// 依赖分析结果
#[derive(Debug, Clone)]
pub struct AnalysedTask {
    /// 参数已填充访问标识，`predecessors` 为尚未结束的前驱
    pub task: Task,
    /// 已失败或被取消的前驱，非空时该任务无法执行
    pub failed_predecessors: Vec<TaskId>,
}

/// 任务结束后的簿记结果
#[derive(Debug, Clone, Default)]
pub struct TaskEndReport {
    pub task_id: TaskId,
    pub app_id: AppId,
    /// 所有前驱都已结束、可以开始执行的后继
    pub released: Vec<TaskId>,
    /// 因本任务失败而无法执行的后继
    pub doomed: Vec<TaskId>,
    /// 本任务是最后写者的输出文件，需要回传
    pub result_files: Vec<DataInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppReport {
    pub app_id: AppId,
    pub total: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

pub struct DependencyTracker {
    registry: Arc<DataRegistry>,
    next_task: AtomicU64,
    apps: Mutex<HashMap<AppId, AppState>>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    writers: Mutex<WriterTable>,
    data_waiters: Mutex<HashMap<TaskId, Vec<SyncSender>>>,
    core_counts: Mutex<BTreeMap<CoreId, u64>>,
}

impl DependencyTracker {
    pub fn new(registry: Arc<DataRegistry>) -> Self {
        Self {
            registry,
            next_task: AtomicU64::new(1),
            apps: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            writers: Mutex::new(WriterTable::default()),
            data_waiters: Mutex::new(HashMap::new()),
            core_counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DataRegistry> {
        &self.registry
    }

    /// 分析新任务的数据访问并登记依赖
    ///
    /// 数据访问全部登记成功后才计入应用的任务数，失败的提交不会阻塞屏障。
    pub async fn new_task(
        &self,
        app_id: AppId,
        description: TaskDescription,
        monitor: Arc<dyn TaskMonitor>,
    ) -> SchedulerResult<AnalysedTask> {
        if self
            .apps
            .lock()
            .await
            .get(&app_id)
            .is_some_and(|app| app.closed)
        {
            return Err(SchedulerError::ApplicationClosed { app_id });
        }

        let task_id = self.next_task.fetch_add(1, Ordering::SeqCst);
        let mut task = Task::new(task_id, app_id, description).with_monitor(monitor);
        self.register_accesses(&mut task).await?;

        {
            let mut apps = self.apps.lock().await;
            let app = apps.entry(app_id).or_default();
            app.live += 1;
            app.total += 1;
        }
        *self
            .core_counts
            .lock()
            .await
            .entry(task.description.core_id)
            .or_insert(0) += 1;

        let mut predecessors = BTreeSet::new();
        let mut failed_predecessors = BTreeSet::new();

        let mut tasks = self.tasks.lock().await;
        let mut writers = self.writers.lock().await;
        for param in &task.description.parameters {
            let Some(access) = param.access else {
                continue;
            };
            let mode = param.direction.access_mode();
            let data_id = access.data_id();

            if mode.reads() {
                if let Some(writer) = writers.last.get(&data_id).copied() {
                    if writer != task_id {
                        match tasks.get(&writer).map(|t| t.state) {
                            Some(TaskState::Failed | TaskState::Canceled) => {
                                failed_predecessors.insert(writer);
                            }
                            Some(TaskState::ToAnalyse | TaskState::ToExecute) => {
                                predecessors.insert(writer);
                            }
                            Some(TaskState::Finished) | None => {}
                        }
                    }
                }
            }

            if mode.writes() {
                if let Some(previous) = writers.set(data_id, task_id) {
                    Self::forget_if_done(&mut tasks, &writers, previous);
                }
            }
        }
        drop(writers);

        for predecessor in &predecessors {
            if let Some(pred) = tasks.get_mut(predecessor) {
                pred.successors.insert(task_id);
            }
        }
        debug!(
            "任务 {} ({}) 依赖: {:?}",
            task_id,
            task.name(),
            predecessors
        );
        task.predecessors = predecessors;
        task.state = TaskState::ToExecute;
        tasks.insert(task_id, task.clone());

        Ok(AnalysedTask {
            task,
            failed_predecessors: failed_predecessors.into_iter().collect(),
        })
    }

    /// 为参与依赖分析的参数登记数据访问，基本类型参数只能作为输入
    async fn register_accesses(&self, task: &mut Task) -> SchedulerResult<()> {
        let task_id = task.id;
        if let Some(param) = task
            .description
            .parameters
            .iter()
            .find(|p| !p.is_dependency() && p.direction != Direction::In)
        {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "任务 {} 的 {:?} 参数只能作为输入",
                task_id,
                param.data_type()
            )));
        }
        for param in task.description.parameters.iter_mut() {
            if !param.is_dependency() {
                continue;
            }
            if param.reclassify_persistent() {
                debug!("任务 {} 的参数已持久化，按持久化对象处理", task_id);
            }
            let mode = param.direction.access_mode();
            param.access = Some(self.registry.register_access(&param.value, mode).await?);
        }
        Ok(())
    }

    /// 已结束且不再是任何数据最后写者的任务从表中移除
    fn forget_if_done(tasks: &mut HashMap<TaskId, Task>, writers: &WriterTable, task_id: TaskId) {
        let done = tasks
            .get(&task_id)
            .is_some_and(|t| t.state.is_terminal());
        if done && !writers.holds(task_id) {
            tasks.remove(&task_id);
        }
    }

    /// 任务结束：更新应用计数、释放等待者、计算可以开始的后继
    pub async fn end_task(&self, task_id: TaskId, state: TaskState) -> SchedulerResult<TaskEndReport> {
        if !state.is_terminal() {
            return Err(SchedulerError::Internal(format!(
                "任务 {task_id} 不能以状态 {state:?} 结束"
            )));
        }
        let mut apps = self.apps.lock().await;
        let mut tasks = self.tasks.lock().await;
        let writers = self.writers.lock().await;
        let mut data_waiters = self.data_waiters.lock().await;

        let task = tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        if task.state.is_terminal() {
            return Err(SchedulerError::Internal(format!(
                "任务 {task_id} 已经结束 ({:?})",
                task.state
            )));
        }
        task.state = state;
        let app_id = task.app_id;
        let successors = std::mem::take(&mut task.successors);
        let parameters = task.description.parameters.clone();

        let mut report = TaskEndReport {
            task_id,
            app_id,
            ..Default::default()
        };
        let mut written_files = Vec::new();
        for param in &parameters {
            let Some(access) = param.access else {
                continue;
            };
            self.registry.data_has_been_accessed(&access).await?;
            if state != TaskState::Finished || param.data_type() != DataType::File {
                continue;
            }
            if let Some(written) = access.written_instance() {
                written_files.push(written.data_id);
                if writers.last.get(&written.data_id) == Some(&task_id) {
                    report.result_files.push(written);
                }
            }
        }

        for successor in successors {
            let Some(succ) = tasks.get_mut(&successor) else {
                continue;
            };
            succ.predecessors.remove(&task_id);
            if state == TaskState::Finished {
                if succ.predecessors.is_empty() && succ.state == TaskState::ToExecute {
                    report.released.push(successor);
                }
            } else if !succ.state.is_terminal() {
                report.doomed.push(successor);
            }
        }

        if let Some(waiters) = data_waiters.remove(&task_id) {
            for waiter in waiters {
                let result = if state == TaskState::Finished {
                    Ok(())
                } else {
                    Err(SchedulerError::ApplicationFailed {
                        app_id,
                        failed_tasks: vec![task_id],
                    })
                };
                let _ = waiter.send(result);
            }
        }

        let app = apps.entry(app_id).or_default();
        app.live = app.live.saturating_sub(1);
        match state {
            TaskState::Finished => app.completed += 1,
            TaskState::Failed => app.failed.push(task_id),
            _ => app.canceled += 1,
        }
        app.written_files.extend(written_files);
        if app.live == 0 && !app.sync_waiters.is_empty() {
            info!("应用 {} 的任务全部结束，释放同步等待", app_id);
            for waiter in std::mem::take(&mut app.sync_waiters) {
                let _ = waiter.send(app.sync_result(app_id));
            }
        }

        Self::forget_if_done(&mut tasks, &writers, task_id);
        Ok(report)
    }

    /// 屏障：应用的任务全部结束后返回
    pub async fn barrier(&self, app_id: AppId) -> SyncReceiver {
        self.register_sync(app_id, false).await
    }

    /// 应用结束：之后提交的任务被拒绝，所有任务结束后返回
    pub async fn end_of_application(&self, app_id: AppId) -> SyncReceiver {
        self.register_sync(app_id, true).await
    }

    async fn register_sync(&self, app_id: AppId, close: bool) -> SyncReceiver {
        let (tx, rx) = oneshot::channel();
        let mut apps = self.apps.lock().await;
        let app = apps.entry(app_id).or_default();
        if close {
            app.closed = true;
        }
        if app.live == 0 {
            let _ = tx.send(app.sync_result(app_id));
        } else {
            debug!("应用 {} 还有 {} 个任务未结束，等待", app_id, app.live);
            app.sync_waiters.push(tx);
        }
        rx
    }

    /// 等待数据的最后写者结束
    ///
    /// 写访问会把数据的所有权交还给应用，之后的读取不再依赖原写者。
    pub async fn wait_for_data(&self, data_id: DataId, mode: AccessMode) -> SyncReceiver {
        let (tx, rx) = oneshot::channel();
        let mut tasks = self.tasks.lock().await;
        let mut writers = self.writers.lock().await;
        let mut data_waiters = self.data_waiters.lock().await;

        match writers.last.get(&data_id).copied() {
            None => {
                let _ = tx.send(Ok(()));
            }
            Some(writer) => match tasks.get(&writer).map(|t| (t.state, t.app_id)) {
                None | Some((TaskState::Finished, _)) => {
                    let _ = tx.send(Ok(()));
                }
                Some((TaskState::Failed | TaskState::Canceled, app_id)) => {
                    let _ = tx.send(Err(SchedulerError::ApplicationFailed {
                        app_id,
                        failed_tasks: vec![writer],
                    }));
                }
                Some(_) => {
                    debug!("等待任务 {} 生成数据 d{}", writer, data_id);
                    data_waiters.entry(writer).or_default().push(tx);
                }
            },
        }

        if mode.writes() {
            if let Some(previous) = writers.clear(data_id) {
                Self::forget_if_done(&mut tasks, &writers, previous);
            }
        }
        rx
    }

    /// 删除文件：仍有未结束的任务写入时拒绝
    pub async fn delete_file(&self, data_id: DataId) -> bool {
        let mut apps = self.apps.lock().await;
        let mut tasks = self.tasks.lock().await;
        let mut writers = self.writers.lock().await;

        if let Some(writer) = writers.last.get(&data_id).copied() {
            if tasks.get(&writer).is_some_and(|t| !t.state.is_terminal()) {
                warn!("数据 d{} 的写者 {} 仍在执行，不能删除", data_id, writer);
                return false;
            }
            writers.clear(data_id);
            Self::forget_if_done(&mut tasks, &writers, writer);
        }
        for app in apps.values_mut() {
            app.written_files.remove(&data_id);
        }
        true
    }

    pub async fn get_and_remove_written_files(&self, app_id: AppId) -> Vec<DataId> {
        let mut apps = self.apps.lock().await;
        apps.get_mut(&app_id)
            .map(|app| std::mem::take(&mut app.written_files).into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn last_writer(&self, data_id: DataId) -> Option<TaskId> {
        self.writers.lock().await.last.get(&data_id).copied()
    }

    pub async fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.lock().await.get(&task_id).map(|t| t.state)
    }

    pub async fn pending_predecessors(&self, task_id: TaskId) -> Option<BTreeSet<TaskId>> {
        self.tasks
            .lock()
            .await
            .get(&task_id)
            .map(|t| t.predecessors.clone())
    }

    pub async fn tracked_tasks(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn task_report(&self) -> Vec<AppReport> {
        let apps = self.apps.lock().await;
        let mut report: Vec<AppReport> = apps
            .iter()
            .map(|(app_id, app)| AppReport {
                app_id: *app_id,
                total: app.total,
                in_progress: app.live,
                completed: app.completed,
                failed: app.failed.len(),
                canceled: app.canceled,
            })
            .collect();
        report.sort_by_key(|r| r.app_id);
        report
    }

    /// 每种任务类型提交的任务数
    pub async fn core_counts(&self) -> BTreeMap<CoreId, u64> {
        self.core_counts.lock().await.clone()
    }
}
