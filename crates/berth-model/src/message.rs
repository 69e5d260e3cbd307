//! Logical message contract between the agent, the controller and executors.
//!
//! Only the shape is fixed here; framing and encoding belong to the
//! transport plugged in behind the link traits in `berth-core`.

use serde::{Deserialize, Serialize};

use crate::domain::DurationMs;
use crate::executor::ExecutorInfo;
use crate::framework::FrameworkInfo;
use crate::id::{AgentId, Endpoint, ExecutorId, FrameworkId, TaskId, UpdateUuid};
use crate::resources::Resources;
use crate::status::StatusUpdate;
use crate::task::{KillPolicy, TaskInfo, TaskState, TaskStatus};
use crate::version::{ProviderState, ResourceVersionEntry};

/// A message together with the endpoint that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<M> {
    pub from: Endpoint,
    pub message: M,
}

impl<M> Envelope<M> {
    pub fn new(from: Endpoint, message: M) -> Self {
        Self { from, message }
    }
}

/// Controller → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControllerMessage {
    Registered {
        agent_id: AgentId,
        #[serde(default)]
        ping_timeout_ms: Option<DurationMs>,
    },
    Reregistered {
        agent_id: AgentId,
        #[serde(default)]
        ping_timeout_ms: Option<DurationMs>,
    },
    Ping {
        /// Whether the controller considers this agent connected.
        connected: bool,
    },
    RunTask {
        framework: FrameworkInfo,
        task: TaskInfo,
        #[serde(default)]
        resource_versions: Vec<ResourceVersionEntry>,
    },
    RunTaskGroup {
        framework: FrameworkInfo,
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
        #[serde(default)]
        resource_versions: Vec<ResourceVersionEntry>,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    StatusUpdateAcknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    },
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    UpdateFramework {
        framework: FrameworkInfo,
        #[serde(default)]
        scheduler: Option<Endpoint>,
    },
}

impl ControllerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::Registered { .. } => "registered",
            ControllerMessage::Reregistered { .. } => "reregistered",
            ControllerMessage::Ping { .. } => "ping",
            ControllerMessage::RunTask { .. } => "run_task",
            ControllerMessage::RunTaskGroup { .. } => "run_task_group",
            ControllerMessage::KillTask { .. } => "kill_task",
            ControllerMessage::StatusUpdateAcknowledgement { .. } => "status_update_acknowledgement",
            ControllerMessage::ShutdownExecutor { .. } => "shutdown_executor",
            ControllerMessage::ShutdownFramework { .. } => "shutdown_framework",
            ControllerMessage::UpdateFramework { .. } => "update_framework",
        }
    }
}

/// Per-task entry of a re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub framework_id: FrameworkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    pub task_id: TaskId,
    /// Latest known state.
    pub state: TaskState,
    pub resources: Resources,
    /// State of the update currently being delivered, or of the last one
    /// acknowledged when nothing is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_update_state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_update_uuid: Option<UpdateUuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorReport {
    pub framework_id: FrameworkId,
    pub executor: ExecutorInfo,
}

/// Agent → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    Register {
        resources: Resources,
        resource_versions: Vec<ResourceVersionEntry>,
    },
    Reregister {
        agent_id: AgentId,
        resources: Resources,
        resource_versions: Vec<ResourceVersionEntry>,
        frameworks: Vec<FrameworkInfo>,
        executors: Vec<ExecutorReport>,
        tasks: Vec<TaskReport>,
    },
    Pong,
    StatusUpdate {
        update: StatusUpdate,
    },
    /// An executor's boundary is gone.
    ExitedExecutor {
        agent_id: Option<AgentId>,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        #[serde(default)]
        status: Option<i32>,
    },
    /// Unsolicited push of resource version and provider state.
    UpdateAgent {
        agent_id: AgentId,
        resource_versions: Vec<ResourceVersionEntry>,
        providers: Vec<ProviderState>,
    },
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Register { .. } => "register",
            AgentMessage::Reregister { .. } => "reregister",
            AgentMessage::Pong => "pong",
            AgentMessage::StatusUpdate { .. } => "status_update",
            AgentMessage::ExitedExecutor { .. } => "exited_executor",
            AgentMessage::UpdateAgent { .. } => "update_agent",
        }
    }
}

/// Agent → executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutorCommand {
    Registered {
        agent_id: Option<AgentId>,
        framework: FrameworkInfo,
        executor: ExecutorInfo,
    },
    Reregistered {
        agent_id: Option<AgentId>,
    },
    RunTask {
        framework: FrameworkInfo,
        task: TaskInfo,
    },
    RunTaskGroup {
        framework: FrameworkInfo,
        tasks: Vec<TaskInfo>,
    },
    KillTask {
        task_id: TaskId,
        #[serde(default)]
        kill_policy: Option<KillPolicy>,
    },
    Acknowledged {
        task_id: TaskId,
        uuid: UpdateUuid,
    },
    Shutdown,
}

/// Executor → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutorMessage {
    Register,
    /// Sent by an executor that outlived an agent restart.
    Reregister {
        tasks: Vec<TaskInfo>,
        /// Updates the executor never saw acknowledged.
        updates: Vec<TaskStatus>,
    },
    StatusUpdate {
        status: TaskStatus,
    },
}
