//! Read-only copies of agent state, handed out through the agent handle.
use serde::Serialize;

use berth_model::{
    AgentId, ContainerId, Endpoint, ExecutorId, ExecutorKind, FrameworkId, Resources, ResourceVersionEntry, TaskId,
    TaskState, UpdateUuid,
};

use super::state::{AgentState, Executor, ExecutorState, Framework, FrameworkState, Task};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: Option<AgentId>,
    pub state: AgentState,
    pub leader: Option<Endpoint>,
    pub resources: Resources,
    pub resource_versions: Vec<ResourceVersionEntry>,
    pub frameworks: Vec<FrameworkSnapshot>,
    pub completed_frameworks: Vec<FrameworkSnapshot>,
}

impl AgentSnapshot {
    /// Executors whose boundary is expected to be alive.
    pub fn live_executors(&self) -> impl Iterator<Item = (&FrameworkSnapshot, &ExecutorSnapshot)> {
        self.frameworks.iter().flat_map(|f| {
            f.executors
                .iter()
                .filter(|e| e.state != ExecutorState::Terminated)
                .map(move |e| (f, e))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkSnapshot {
    pub id: FrameworkId,
    pub name: String,
    pub state: FrameworkState,
    pub checkpoint: bool,
    pub partition_aware: bool,
    pub executors: Vec<ExecutorSnapshot>,
    pub completed_executors: Vec<ExecutorSnapshot>,
    /// Accepted tasks whose executor does not exist yet.
    pub pending_tasks: Vec<TaskId>,
    /// Tasks that failed before reaching an executor.
    pub unrouted_tasks: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSnapshot {
    pub id: ExecutorId,
    pub framework_id: FrameworkId,
    pub name: String,
    pub kind: ExecutorKind,
    pub container_id: ContainerId,
    pub state: ExecutorState,
    pub resources: Resources,
    pub queued_tasks: Vec<TaskSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
    pub terminated_tasks: Vec<TaskSnapshot>,
    pub completed_tasks: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_update_state: Option<TaskState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_update_uuid: Option<UpdateUuid>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        let marker = task.status_update_marker();
        Self {
            id: task.info.task_id.clone(),
            name: task.info.name.clone(),
            state: task.state,
            resources: task.info.resources.clone(),
            status_update_state: marker.map(|(s, _)| s),
            status_update_uuid: marker.map(|(_, u)| u),
        }
    }
}

fn sorted(mut tasks: Vec<TaskSnapshot>) -> Vec<TaskSnapshot> {
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    tasks
}

impl From<&Executor> for ExecutorSnapshot {
    fn from(exec: &Executor) -> Self {
        let (queued, launched): (Vec<&Task>, Vec<&Task>) =
            exec.tasks.values().partition(|t| exec.is_queued(t.id()) || !t.forwarded);
        Self {
            id: exec.info.executor_id.clone(),
            framework_id: exec.framework_id.clone(),
            name: exec.info.name.clone(),
            kind: exec.info.kind,
            container_id: exec.container_id.clone(),
            state: exec.state,
            resources: exec.allocated(),
            queued_tasks: sorted(queued.into_iter().map(TaskSnapshot::from).collect()),
            tasks: sorted(launched.into_iter().map(TaskSnapshot::from).collect()),
            terminated_tasks: sorted(exec.terminated.values().map(TaskSnapshot::from).collect()),
            completed_tasks: exec.completed.iter().map(TaskSnapshot::from).collect(),
        }
    }
}

impl From<&Framework> for FrameworkSnapshot {
    fn from(fw: &Framework) -> Self {
        let mut executors: Vec<ExecutorSnapshot> = fw.executors.values().map(ExecutorSnapshot::from).collect();
        executors.sort_by(|a, b| a.id.cmp(&b.id));
        let mut pending: Vec<TaskId> = fw.pending.keys().cloned().collect();
        pending.sort();
        Self {
            id: fw.info.id.clone(),
            name: fw.info.name.clone(),
            state: fw.state,
            checkpoint: fw.info.checkpoint,
            partition_aware: fw.info.is_partition_aware(),
            executors,
            completed_executors: fw.completed_executors.iter().cloned().collect(),
            pending_tasks: pending,
            unrouted_tasks: sorted(fw.unrouted.values().map(TaskSnapshot::from).collect()),
        }
    }
}
