use std::sync::Arc;

use tokio::sync::oneshot;

use dataflow_core::{CoreElementConfig, SchedulerResult};
use dataflow_domain::{
    AccessMode, AppId, CollaboratorEvent, CoreId, DataId, ResourceDescription, TaskDescription,
    TaskId, TaskMonitor,
};
use dataflow_worker::Worker;

use crate::dependency_tracker::SyncReceiver;

pub type Reply<T> = oneshot::Sender<T>;

/// 运行时事件循环的输入
pub enum RuntimeEvent {
    NewTask {
        app_id: AppId,
        description: TaskDescription,
        monitor: Arc<dyn TaskMonitor>,
        reply: Reply<SchedulerResult<TaskId>>,
    },
    Barrier {
        app_id: AppId,
        reply: Reply<SyncReceiver>,
    },
    EndOfApplication {
        app_id: AppId,
        reply: Reply<SyncReceiver>,
    },
    WaitForData {
        data_id: DataId,
        mode: AccessMode,
        reply: Reply<SyncReceiver>,
    },
    DeleteFile {
        host: String,
        path: String,
        reply: Reply<bool>,
    },
    AddWorker {
        worker: Worker,
        reply: Reply<SchedulerResult<()>>,
    },
    /// 排空后移除，回复在Worker真正离开资源池时发送
    RemoveWorker {
        name: String,
        reply: Reply<SchedulerResult<()>>,
    },
    ResizeWorker {
        name: String,
        delta: ResourceDescription,
        increase: bool,
        reply: Reply<SchedulerResult<()>>,
    },
    RegisterCoreElement {
        config: CoreElementConfig,
        reply: Reply<SchedulerResult<CoreId>>,
    },
    /// 登记弹性资源创建请求，回复请求编号
    RequestCreation {
        provider: Option<String>,
        description: ResourceDescription,
        reply: Reply<SchedulerResult<u64>>,
    },
    ConfirmCreation {
        request_id: u64,
        worker: Worker,
        reply: Reply<SchedulerResult<()>>,
    },
    CancelCreation {
        request_id: u64,
        reply: Reply<bool>,
    },
    Collaborator(CollaboratorEvent),
    Shutdown,
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::NewTask { .. } => "new_task",
            RuntimeEvent::Barrier { .. } => "barrier",
            RuntimeEvent::EndOfApplication { .. } => "end_of_application",
            RuntimeEvent::WaitForData { .. } => "wait_for_data",
            RuntimeEvent::DeleteFile { .. } => "delete_file",
            RuntimeEvent::AddWorker { .. } => "add_worker",
            RuntimeEvent::RemoveWorker { .. } => "remove_worker",
            RuntimeEvent::ResizeWorker { .. } => "resize_worker",
            RuntimeEvent::RegisterCoreElement { .. } => "register_core_element",
            RuntimeEvent::RequestCreation { .. } => "request_creation",
            RuntimeEvent::ConfirmCreation { .. } => "confirm_creation",
            RuntimeEvent::CancelCreation { .. } => "cancel_creation",
            RuntimeEvent::Collaborator(_) => "collaborator",
            RuntimeEvent::Shutdown => "shutdown",
        }
    }
}
