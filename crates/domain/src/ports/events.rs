use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{ActionId, DataInstance, DataLocation, JobId};

use super::JobResult;

/// 协作方投递给运行时的完成/失败通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CollaboratorEvent {
    JobCompleted {
        action_id: ActionId,
        job_id: JobId,
        result: JobResult,
    },
    JobFailed {
        action_id: ActionId,
        job_id: JobId,
        reason: String,
    },
    TransferCompleted {
        action_id: Option<ActionId>,
        group: u64,
        data: DataInstance,
        target: DataLocation,
    },
    TransferFailed {
        action_id: Option<ActionId>,
        group: u64,
        data: DataInstance,
        reason: String,
    },
}

pub type CollaboratorSender = mpsc::UnboundedSender<CollaboratorEvent>;

pub(crate) fn post(sender: &CollaboratorSender, event: CollaboratorEvent) {
    if sender.send(event).is_err() {
        debug!("运行时已关闭，丢弃协作方通知");
    }
}
