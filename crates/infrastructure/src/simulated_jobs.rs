use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use dataflow_core::SchedulerResult;
use dataflow_domain::{
    DataType, Direction, JobDescription, JobHandle, JobId, JobListener, JobResult, JobSubmitter,
    ParamResult,
};

/// 模拟执行的参数
#[derive(Debug, Clone, Copy)]
pub struct SimulationConfig {
    /// 每个作业的执行时间
    pub latency: Duration,
    /// 作业失败的概率，取值 [0, 1]
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            failure_rate: 0.0,
        }
    }
}

impl SimulationConfig {
    fn should_fail(&self) -> bool {
        self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate.min(1.0))
    }
}

struct SimulatedJob {
    job_id: JobId,
    task: AbortHandle,
}

impl JobHandle for SimulatedJob {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn stop(&self) {
        self.task.abort();
    }
}

/// 在本进程内模拟作业执行
///
/// 每个作业在独立的 tokio 任务中等待 `latency` 后按 `failure_rate` 随机成功或失败，
/// 成功时为输出参数生成位置与值。
#[derive(Debug, Default)]
pub struct SimulatedJobSubmitter {
    config: SimulationConfig,
}

impl SimulatedJobSubmitter {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn result_of(job: &JobDescription) -> JobResult {
        let dir = job.working_dir.trim_end_matches('/');
        let params = job
            .parameters
            .iter()
            .map(|param| {
                if param.direction == Direction::In {
                    return None;
                }
                Some(match param.data_type {
                    DataType::File => ParamResult {
                        location: Some(format!("{dir}/{}", param.renaming.as_ref()?)),
                        ..ParamResult::default()
                    },
                    DataType::Object => ParamResult {
                        location: param.renaming.clone(),
                        value: Some(json!({ "job": job.job_id, "task": job.task_name })),
                        ..ParamResult::default()
                    },
                    DataType::Persistent => ParamResult {
                        persistent_id: param.persistent_id.clone(),
                        ..ParamResult::default()
                    },
                    DataType::Basic | DataType::String => return None,
                })
            })
            .collect();
        JobResult { params }
    }
}

#[async_trait]
impl JobSubmitter for SimulatedJobSubmitter {
    async fn submit(
        &self,
        job: JobDescription,
        listener: JobListener,
    ) -> SchedulerResult<Box<dyn JobHandle>> {
        let job_id = job.job_id;
        let fail = self.config.should_fail();
        let latency = self.config.latency;
        let result = Self::result_of(&job);
        info!(
            job_id,
            worker = %job.worker,
            implementation = job.implementation.kind.name(),
            "启动作业 {}",
            job.task_name
        );

        let task = tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if fail {
                debug!(job_id, "模拟作业失败");
                listener.failed(format!("作业 {job_id} 在模拟执行中失败"));
            } else {
                listener.completed(result);
            }
        });
        Ok(Box::new(SimulatedJob {
            job_id,
            task: task.abort_handle(),
        }))
    }
}
