use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dataflow_core::SchedulerResult;

use crate::models::{ActionId, AppId, DataType, Direction, Implementation, JobId, TaskId};

use super::events::{post, CollaboratorEvent, CollaboratorSender};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub direction: Direction,
    pub data_type: DataType,
    /// 远端使用的数据名称（`d<id>v<version>`）
    pub renaming: Option<String>,
    /// 基本类型的值
    pub value: Option<serde_json::Value>,
    pub persistent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobDescription {
    pub job_id: JobId,
    pub action_id: ActionId,
    pub task_id: TaskId,
    pub app_id: AppId,
    pub task_name: String,
    pub implementation: Arc<Implementation>,
    pub worker: String,
    pub host: String,
    pub working_dir: String,
    pub slaves: Vec<String>,
    pub parameters: Vec<JobParameter>,
}

/// 单个输出参数的结果描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamResult {
    /// 文件路径或对象名称
    pub location: Option<String>,
    pub persistent_id: Option<String>,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// 与任务参数一一对应，输入参数为 `None`
    pub params: Vec<Option<ParamResult>>,
}

impl JobResult {
    pub fn param(&self, index: usize) -> Option<&ParamResult> {
        self.params.get(index).and_then(|p| p.as_ref())
    }
}

pub trait JobHandle: Send + Sync {
    fn job_id(&self) -> JobId;

    fn stop(&self);
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// 提交作业，完成或失败通过 `listener` 异步通知
    async fn submit(
        &self,
        job: JobDescription,
        listener: JobListener,
    ) -> SchedulerResult<Box<dyn JobHandle>>;
}

/// 作业完成监听器
#[derive(Debug, Clone)]
pub struct JobListener {
    action_id: ActionId,
    job_id: JobId,
    sender: CollaboratorSender,
}

impl JobListener {
    pub fn new(action_id: ActionId, job_id: JobId, sender: CollaboratorSender) -> Self {
        Self {
            action_id,
            job_id,
            sender,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn completed(&self, result: JobResult) {
        post(
            &self.sender,
            CollaboratorEvent::JobCompleted {
                action_id: self.action_id,
                job_id: self.job_id,
                result,
            },
        );
    }

    pub fn failed(&self, reason: impl Into<String>) {
        post(
            &self.sender,
            CollaboratorEvent::JobFailed {
                action_id: self.action_id,
                job_id: self.job_id,
                reason: reason.into(),
            },
        );
    }
}
