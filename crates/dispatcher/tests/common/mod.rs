#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use dataflow_core::{
    AppConfig, CoreElementConfig, ImplementationConfig, SchedulerError, SchedulerResult,
    WorkerConfig,
};
use dataflow_dispatcher::Runtime;
use dataflow_domain::{
    DataLocation, DataTransfer, DataType, Direction, JobDescription, JobHandle, JobId, JobListener,
    JobResult, JobSubmitter, ParamResult, PersistentStorage, TaskId, TaskMonitor,
    TransferListener, TransferReason, TransferRequest,
};

pub const APP: u64 = 1;

pub fn worker(name: &str, cpu_cores: u32) -> WorkerConfig {
    WorkerConfig {
        name: name.to_string(),
        host: None,
        working_dir: "/tmp/dataflow/worker".to_string(),
        cpu_cores,
        gpus: 0,
        memory_mb: 0,
        app_id: None,
        dynamic: false,
        provider: None,
    }
}

pub fn dynamic_worker(name: &str, cpu_cores: u32) -> WorkerConfig {
    WorkerConfig {
        dynamic: true,
        ..worker(name, cpu_cores)
    }
}

/// 单一任务类型 `increment()`，方法实现需要1个核心
pub fn config(workers: Vec<WorkerConfig>) -> AppConfig {
    AppConfig {
        workers,
        core_elements: vec![CoreElementConfig {
            signature: "increment()".to_string(),
            implementations: vec![ImplementationConfig {
                kind: "method".to_string(),
                target: "demo.Increment".to_string(),
                cpu_cores: 1,
                gpus: 0,
                memory_mb: 0,
                processes: None,
            }],
        }],
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub runtime: Runtime,
    pub jobs: Arc<ScriptedJobs>,
    pub transfers: Arc<RecordingTransfers>,
    pub storage: Arc<MemoryStorage>,
}

pub fn start(config: AppConfig) -> Harness {
    start_with(config, ScriptedJobs::default())
}

pub fn start_with(config: AppConfig, jobs: ScriptedJobs) -> Harness {
    let jobs = Arc::new(jobs);
    let transfers = Arc::new(RecordingTransfers::default());
    let storage = Arc::new(MemoryStorage::default());
    let runtime = Runtime::builder(config)
        .with_job_submitter(jobs.clone())
        .with_data_transfer(transfers.clone())
        .with_storage(storage.clone())
        .build()
        .unwrap();
    Harness {
        runtime,
        jobs,
        transfers,
        storage,
    }
}

struct TestHandle {
    job_id: JobId,
}

impl JobHandle for TestHandle {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn stop(&self) {}
}

/// 按脚本决定作业成败的作业提交方
///
/// 输出参数的结果值为作业号，便于断言数据来自哪次执行。
#[derive(Default)]
pub struct ScriptedJobs {
    submitted: Mutex<Vec<JobDescription>>,
    failures_left: AtomicUsize,
    failing_workers: Mutex<HashSet<String>>,
    failing_tasks: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedJobs {
    pub fn failing_first(count: usize) -> Self {
        let jobs = Self::default();
        jobs.failures_left.store(count, Ordering::SeqCst);
        jobs
    }

    pub fn failing_on_worker(worker: &str) -> Self {
        let jobs = Self::default();
        jobs.failing_workers
            .lock()
            .unwrap()
            .insert(worker.to_string());
        jobs
    }

    pub fn failing_task(name: &str) -> Self {
        let jobs = Self::default();
        jobs.failing_tasks.lock().unwrap().insert(name.to_string());
        jobs
    }

    /// 作业在闸门放行后才结束
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn submitted(&self) -> Vec<JobDescription> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn workers_of(&self, task_id: TaskId) -> Vec<String> {
        self.submitted()
            .into_iter()
            .filter(|j| j.task_id == task_id)
            .map(|j| j.worker)
            .collect()
    }

    fn should_fail(&self, job: &JobDescription) -> bool {
        if self.failing_workers.lock().unwrap().contains(&job.worker)
            || self.failing_tasks.lock().unwrap().contains(&job.task_name)
        {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobSubmitter for ScriptedJobs {
    async fn submit(
        &self,
        job: JobDescription,
        listener: JobListener,
    ) -> SchedulerResult<Box<dyn JobHandle>> {
        let fail = self.should_fail(&job);
        let result = JobResult {
            params: job
                .parameters
                .iter()
                .map(|p| {
                    (p.direction != Direction::In && p.data_type == DataType::Object).then(|| {
                        ParamResult {
                            value: Some(json!(job.job_id)),
                            ..ParamResult::default()
                        }
                    })
                })
                .collect(),
        };
        let job_id = job.job_id;
        self.submitted.lock().unwrap().push(job);

        let gate = self.gate.clone();
        tokio::spawn(async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            tokio::task::yield_now().await;
            if fail {
                listener.failed(format!("作业 {job_id} 脚本失败"));
            } else {
                listener.completed(result);
            }
        });
        Ok(Box::new(TestHandle { job_id }))
    }
}

/// 记录请求的传输服务，可让输入传输全部失败
#[derive(Default)]
pub struct RecordingTransfers {
    requests: Mutex<Vec<TransferRequest>>,
    fail_staging: AtomicBool,
}

impl RecordingTransfers {
    pub fn fail_staging(&self) {
        self.fail_staging.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self, reason: TransferReason) -> Vec<TransferRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DataTransfer for RecordingTransfers {
    async fn transfer(
        &self,
        request: TransferRequest,
        listener: TransferListener,
    ) -> SchedulerResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        if request.reason == TransferReason::InputStaging && self.fail_staging.load(Ordering::SeqCst)
        {
            listener.failed(&request, "链路中断");
        } else {
            listener.completed(&request);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    versions: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, bool, String)>>,
    broken: AtomicBool,
}

impl MemoryStorage {
    pub fn break_backend(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, bool, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistentStorage for MemoryStorage {
    async fn locations(&self, _id: &str) -> SchedulerResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn new_version(
        &self,
        id: &str,
        preserve_source: bool,
        target_worker: &str,
    ) -> SchedulerResult<String> {
        self.calls.lock().unwrap().push((
            id.to_string(),
            preserve_source,
            target_worker.to_string(),
        ));
        if self.broken.load(Ordering::SeqCst) {
            return Err(SchedulerError::StorageBackend("后端不可用".to_string()));
        }
        let mut versions = self.versions.lock().unwrap();
        let version = versions.entry(id.to_string()).or_insert(0);
        *version += 1;
        Ok(format!("{id}.v{version}"))
    }
}

/// 按顺序记录回调
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl TaskMonitor for RecordingMonitor {
    fn on_creation(&self, _task_id: TaskId) {
        self.push("creation".to_string());
    }

    fn on_schedule(&self, _task_id: TaskId, worker: &str) {
        self.push(format!("schedule:{worker}"));
    }

    fn on_submission(&self, _task_id: TaskId, job_id: JobId) {
        self.push(format!("submission:{job_id}"));
    }

    fn on_value_generated(
        &self,
        _task_id: TaskId,
        param_index: usize,
        _data_type: DataType,
        location: &DataLocation,
    ) {
        self.push(format!("value:{param_index}:{location}"));
    }

    fn on_successful_execution(&self, _task_id: TaskId) {
        self.push("success".to_string());
    }

    fn on_failed_execution(&self, _task_id: TaskId, error: &SchedulerError) {
        self.push(format!("failed:{error}"));
    }

    fn on_error_execution(&self, _task_id: TaskId, _reason: &str) {
        self.push("error".to_string());
    }

    fn on_completion(&self, _task_id: TaskId) {
        self.push("completion".to_string());
    }
}
