use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dataflow_core::SchedulerResult;

use crate::models::{ActionId, DataInstance, DataLocation};

use super::events::{post, CollaboratorEvent, CollaboratorSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    InputStaging,
    /// 应用最终结果文件回传到主节点
    ResultFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub data: DataInstance,
    /// 数据尚无已知副本时为空
    pub source: Option<DataLocation>,
    pub target: DataLocation,
    pub reason: TransferReason,
}

#[async_trait]
pub trait DataTransfer: Send + Sync {
    async fn transfer(&self, request: TransferRequest, listener: TransferListener)
        -> SchedulerResult<()>;
}

#[derive(Debug, Clone)]
pub struct TransferListener {
    action_id: Option<ActionId>,
    group: u64,
    sender: CollaboratorSender,
}

impl TransferListener {
    pub fn new(action_id: Option<ActionId>, group: u64, sender: CollaboratorSender) -> Self {
        Self {
            action_id,
            group,
            sender,
        }
    }

    pub fn completed(&self, request: &TransferRequest) {
        post(
            &self.sender,
            CollaboratorEvent::TransferCompleted {
                action_id: self.action_id,
                group: self.group,
                data: request.data,
                target: request.target.clone(),
            },
        );
    }

    pub fn failed(&self, request: &TransferRequest, reason: impl Into<String>) {
        post(
            &self.sender,
            CollaboratorEvent::TransferFailed {
                action_id: self.action_id,
                group: self.group,
                data: request.data,
                reason: reason.into(),
            },
        );
    }
}
