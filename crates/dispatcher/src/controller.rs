use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dataflow_core::{AppConfig, CoreElementConfig, SchedulerError, SchedulerResult, WorkerConfig};
use dataflow_domain::{
    AccessMode, AppId, CoreId, CoreRegistry, DataId, DataSnapshot, DataTransfer, JobSubmitter,
    NoopMetrics, NoopMonitor, ParameterValue, PersistentStorage, ResourceDescription,
    RuntimeMetrics, TaskDescription, TaskId, TaskMonitor,
};
use dataflow_worker::{PoolState, Worker, WorkerPool};

use crate::data_registry::DataRegistry;
use crate::dependency_tracker::{AppReport, DependencyTracker, SyncReceiver};
use crate::engine::{Collaborators, RuntimeEngine};
use crate::events::RuntimeEvent;

/// 运行时统计报告
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    pub apps: Vec<AppReport>,
    /// 每种任务类型提交的任务数
    pub core_counts: BTreeMap<CoreId, u64>,
}

impl fmt::Display for RuntimeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "运行时任务统计:")?;
        for app in &self.apps {
            writeln!(
                f,
                "  应用 {}: 共 {} 个任务，进行中 {}，完成 {}，失败 {}，取消 {}",
                app.app_id, app.total, app.in_progress, app.completed, app.failed, app.canceled
            )?;
        }
        for (core, count) in &self.core_counts {
            writeln!(f, "  任务类型 {core}: {count} 次提交")?;
        }
        Ok(())
    }
}

pub struct RuntimeBuilder {
    config: AppConfig,
    jobs: Option<Arc<dyn JobSubmitter>>,
    transfers: Option<Arc<dyn DataTransfer>>,
    storage: Option<Arc<dyn PersistentStorage>>,
    metrics: Arc<dyn RuntimeMetrics>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            jobs: None,
            transfers: None,
            storage: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_job_submitter(mut self, jobs: Arc<dyn JobSubmitter>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_data_transfer(mut self, transfers: Arc<dyn DataTransfer>) -> Self {
        self.transfers = Some(transfers);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RuntimeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 组装各组件并在当前 tokio 运行时上启动事件循环
    pub fn build(self) -> SchedulerResult<Runtime> {
        let missing = |what: &str| SchedulerError::Configuration(format!("缺少协作方: {what}"));
        let collaborators = Collaborators {
            jobs: self.jobs.ok_or_else(|| missing("作业提交"))?,
            transfers: self.transfers.ok_or_else(|| missing("数据传输"))?,
            storage: self.storage.ok_or_else(|| missing("持久化存储"))?,
            metrics: self.metrics,
        };

        let core_registry = CoreRegistry::from_config(&self.config.core_elements)?;
        let pool = WorkerPool::from_config(&self.config, core_registry)?;
        info!(
            "资源池初始化完成: {} 个Worker，{} 种任务类型",
            pool.len(),
            pool.registry().core_count()
        );
        let pool = Arc::new(RwLock::new(pool));
        let registry = Arc::new(DataRegistry::new(self.config.runtime.master_name.clone()));
        let tracker = Arc::new(DependencyTracker::new(registry.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (collaborator_tx, collaborator_rx) = mpsc::unbounded_channel();
        let engine = RuntimeEngine::new(
            self.config.scheduler.clone(),
            tracker.clone(),
            pool.clone(),
            collaborators,
            collaborator_tx,
        );
        let handle = tokio::spawn(engine.run(events_rx, collaborator_rx));

        Ok(Runtime {
            events: events_tx,
            tracker,
            registry,
            pool,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// 应用侧使用的运行时入口
///
/// 所有修改状态的请求都转成事件交给事件循环处理，查询直接读取共享状态。
pub struct Runtime {
    events: mpsc::UnboundedSender<RuntimeEvent>,
    tracker: Arc<DependencyTracker>,
    registry: Arc<DataRegistry>,
    pool: Arc<RwLock<WorkerPool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RuntimeEvent,
    ) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(build(tx))
            .map_err(|_| SchedulerError::ChannelClosed)?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)
    }

    async fn await_sync(rx: SyncReceiver) -> SchedulerResult<()> {
        rx.await.map_err(|_| SchedulerError::ChannelClosed)?
    }

    /// 提交任务，返回任务标识
    pub async fn execute_task(
        &self,
        app_id: AppId,
        description: TaskDescription,
        monitor: Option<Arc<dyn TaskMonitor>>,
    ) -> SchedulerResult<TaskId> {
        let monitor = monitor.unwrap_or_else(|| Arc::new(NoopMonitor));
        self.request(|reply| RuntimeEvent::NewTask {
            app_id,
            description,
            monitor,
            reply,
        })
        .await?
    }

    /// 等待应用已提交的任务全部结束，有任务失败时返回 `ApplicationFailed`
    pub async fn barrier(&self, app_id: AppId) -> SchedulerResult<()> {
        let rx = self
            .request(|reply| RuntimeEvent::Barrier { app_id, reply })
            .await?;
        Self::await_sync(rx).await
    }

    /// 关闭应用并等待其任务全部结束，返回应用写入过的文件数据
    pub async fn end_of_application(&self, app_id: AppId) -> SchedulerResult<Vec<DataId>> {
        let rx = self
            .request(|reply| RuntimeEvent::EndOfApplication { app_id, reply })
            .await?;
        Self::await_sync(rx).await?;
        let files = self.tracker.get_and_remove_written_files(app_id).await;
        debug!("应用 {} 结束，写入过 {} 个文件", app_id, files.len());
        Ok(files)
    }

    /// 等待数据的最后写者结束后返回当前值
    pub async fn wait_for_data(
        &self,
        data_id: DataId,
        mode: AccessMode,
    ) -> SchedulerResult<DataSnapshot> {
        let rx = self
            .request(|reply| RuntimeEvent::WaitForData {
                data_id,
                mode,
                reply,
            })
            .await?;
        Self::await_sync(rx).await?;
        self.registry.get_data(data_id).await
    }

    /// 不等待写者，直接读取当前值
    pub async fn get_data(&self, data_id: DataId) -> SchedulerResult<DataSnapshot> {
        self.registry.get_data(data_id).await
    }

    pub async fn data_id_of(&self, value: &ParameterValue) -> Option<DataId> {
        self.registry.find(value).await
    }

    /// 删除文件数据，仍有任务写入时返回 `false`
    pub async fn delete_file(&self, host: &str, path: &str) -> SchedulerResult<bool> {
        let host = host.to_string();
        let path = path.to_string();
        self.request(|reply| RuntimeEvent::DeleteFile { host, path, reply })
            .await
    }

    pub async fn add_worker(&self, worker: Worker) -> SchedulerResult<()> {
        self.request(|reply| RuntimeEvent::AddWorker { worker, reply })
            .await?
    }

    pub async fn add_worker_config(&self, config: &WorkerConfig) -> SchedulerResult<()> {
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        self.add_worker(Worker::from_config(config)).await
    }

    /// 排空并移除Worker，Worker上的动作全部结束后返回
    pub async fn remove_worker(&self, name: &str) -> SchedulerResult<()> {
        let name = name.to_string();
        self.request(|reply| RuntimeEvent::RemoveWorker { name, reply })
            .await?
    }

    pub async fn resize_worker(
        &self,
        name: &str,
        delta: ResourceDescription,
        increase: bool,
    ) -> SchedulerResult<()> {
        let name = name.to_string();
        self.request(|reply| RuntimeEvent::ResizeWorker {
            name,
            delta,
            increase,
            reply,
        })
        .await?
    }

    /// 登记弹性资源创建请求，待创建资源的槽位计入资源池总量
    pub async fn request_creation(
        &self,
        provider: Option<String>,
        description: ResourceDescription,
    ) -> SchedulerResult<u64> {
        self.request(|reply| RuntimeEvent::RequestCreation {
            provider,
            description,
            reply,
        })
        .await?
    }

    /// 创建完成，资源按动态Worker加入
    pub async fn confirm_creation(
        &self,
        request_id: u64,
        config: &WorkerConfig,
    ) -> SchedulerResult<()> {
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        let worker = Worker::from_config(&WorkerConfig {
            dynamic: true,
            ..config.clone()
        });
        self.request(|reply| RuntimeEvent::ConfirmCreation {
            request_id,
            worker,
            reply,
        })
        .await?
    }

    pub async fn cancel_creation(&self, request_id: u64) -> SchedulerResult<bool> {
        self.request(|reply| RuntimeEvent::CancelCreation { request_id, reply })
            .await
    }

    pub async fn register_core_element(&self, config: CoreElementConfig) -> SchedulerResult<CoreId> {
        self.request(|reply| RuntimeEvent::RegisterCoreElement { config, reply })
            .await?
    }

    pub async fn task_report(&self) -> RuntimeReport {
        RuntimeReport {
            apps: self.tracker.task_report().await,
            core_counts: self.tracker.core_counts().await,
        }
    }

    pub async fn pool_state(&self) -> PoolState {
        self.pool.read().await.state()
    }

    /// 停止事件循环，正在运行的作业收到停止通知
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        if self.events.send(RuntimeEvent::Shutdown).is_err() {
            debug!("事件循环已经退出");
        }
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("事件循环异常退出: {}", e);
                return Err(SchedulerError::Internal(e.to_string()));
            }
        }
        info!("运行时已关闭");
        Ok(())
    }
}
