use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{NoopMonitor, TaskMonitor};

use super::{ActionId, AppId, CoreId, Parameter, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    ToAnalyse,
    ToExecute,
    Finished,
    Failed,
    /// 前驱失败导致无法执行
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    Single,
    /// 每个兼容的Worker执行一次
    Replicated,
    /// 按轮询选出的一个Worker执行
    Distributed,
}

/// 应用提交的任务描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub core_id: CoreId,
    pub name: String,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub replicated: bool,
    #[serde(default)]
    pub distributed: bool,
}

impl TaskDescription {
    pub fn new(core_id: CoreId, name: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            core_id,
            name: name.into(),
            parameters,
            priority: false,
            replicated: false,
            distributed: false,
        }
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn replicated(mut self) -> Self {
        self.replicated = true;
        self
    }

    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }

    pub fn multiplicity(&self) -> Multiplicity {
        if self.replicated {
            Multiplicity::Replicated
        } else if self.distributed {
            Multiplicity::Distributed
        } else {
            Multiplicity::Single
        }
    }
}

#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub app_id: AppId,
    pub description: TaskDescription,
    pub state: TaskState,
    /// 尚未结束的前驱任务
    pub predecessors: BTreeSet<TaskId>,
    pub successors: BTreeSet<TaskId>,
    pub actions: Vec<ActionId>,
    pub monitor: Arc<dyn TaskMonitor>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, app_id: AppId, description: TaskDescription) -> Self {
        Self {
            id,
            app_id,
            description,
            state: TaskState::ToAnalyse,
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
            actions: Vec::new(),
            monitor: Arc::new(NoopMonitor),
            created_at: Utc::now(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn TaskMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn core_id(&self) -> CoreId {
        self.description.core_id
    }

    pub fn is_free(&self) -> bool {
        self.predecessors.is_empty()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .field("name", &self.description.name)
            .field("state", &self.state)
            .field("predecessors", &self.predecessors)
            .field("successors", &self.successors)
            .finish()
    }
}
