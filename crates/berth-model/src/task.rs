use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DurationMs, Env, Labels};
use crate::error::{ModelError, ModelResult};
use crate::executor::ExecutorInfo;
use crate::id::{ExecutorId, TaskId, UpdateUuid};
use crate::resources::Resources;

/// Lifecycle state of a task.
///
/// `Staging → Starting → Running → {Finished, Failed, Killed, Lost, Gone, Dropped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    /// Recoverable loss reported to frameworks that are not partition-aware.
    Lost,
    /// Final loss reported to partition-aware frameworks.
    Gone,
    /// The task never reached an executor.
    Dropped,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Gone
                | TaskState::Dropped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
            TaskState::Gone => "TASK_GONE",
            TaskState::Dropped => "TASK_DROPPED",
        }
    }

    /// Lower-case label used for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskState::Staging => "staging",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::Lost => "lost",
            TaskState::Gone => "gone",
            TaskState::Dropped => "dropped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        let norm = s.trim().to_ascii_uppercase();
        let bare = norm.strip_prefix("TASK_").unwrap_or(norm.as_str());
        match bare {
            "STAGING" => Ok(TaskState::Staging),
            "STARTING" => Ok(TaskState::Starting),
            "RUNNING" => Ok(TaskState::Running),
            "FINISHED" => Ok(TaskState::Finished),
            "FAILED" => Ok(TaskState::Failed),
            "KILLED" => Ok(TaskState::Killed),
            "LOST" => Ok(TaskState::Lost),
            "GONE" => Ok(TaskState::Gone),
            "DROPPED" => Ok(TaskState::Dropped),
            _ => Err(ModelError::UnknownTaskState(s.to_string())),
        }
    }
}

/// Component that produced a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Agent,
    Executor,
    Controller,
}

/// Machine-readable cause attached to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ExecutorRegistrationTimeout,
    ExecutorReregistrationTimeout,
    ExecutorTerminated,
    ContainerUpdateFailed,
    ContainerLaunchFailed,
    TaskKilledDuringLaunch,
    InvalidOffers,
    FrameworkRemoved,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ExecutorRegistrationTimeout => "executor_registration_timeout",
            Reason::ExecutorReregistrationTimeout => "executor_reregistration_timeout",
            Reason::ExecutorTerminated => "executor_terminated",
            Reason::ContainerUpdateFailed => "container_update_failed",
            Reason::ContainerLaunchFailed => "container_launch_failed",
            Reason::TaskKilledDuringLaunch => "task_killed_during_launch",
            Reason::InvalidOffers => "invalid_offers",
            Reason::FrameworkRemoved => "framework_removed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task's state as reported by one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    /// Set by the sender; filled in by the agent when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<UpdateUuid>,
    /// Seconds since the unix epoch.
    #[serde(default)]
    pub timestamp: f64,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState, source: Source) -> Self {
        Self {
            task_id,
            state,
            source,
            reason: None,
            message: None,
            executor_id: None,
            uuid: None,
            timestamp: 0.0,
        }
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_executor(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = Some(executor_id);
        self
    }

    pub fn with_uuid(mut self, uuid: UpdateUuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// How a task should be terminated when killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillPolicy {
    /// Upper bound between the termination signal and the forced kill.
    pub grace_period_ms: DurationMs,
}

impl KillPolicy {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Process to run for a task or a custom executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    /// Shell snippet when `shell` is set, otherwise the program to exec.
    pub value: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: bool,
    #[serde(default)]
    pub env: Env,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

fn default_shell() -> bool {
    true
}

impl CommandInfo {
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            args: Vec::new(),
            shell: true,
            env: Env::default(),
            cwd: None,
        }
    }

    /// Program and argv as they should be handed to `exec`.
    pub fn argv(&self) -> (String, Vec<String>) {
        if self.shell {
            (
                "/bin/sh".to_string(),
                vec!["sh".to_string(), "-c".to_string(), self.value.clone()],
            )
        } else {
            let mut argv = vec![self.value.clone()];
            argv.extend(self.args.iter().cloned());
            (self.value.clone(), argv)
        }
    }
}

/// Launch description for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: Resources,
    /// Absent for tasks that carry their own command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_policy: Option<KillPolicy>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

impl TaskInfo {
    pub fn command(task_id: impl Into<TaskId>, command: CommandInfo, resources: Resources) -> Self {
        Self {
            task_id: task_id.into(),
            name: String::new(),
            resources,
            executor: None,
            command: Some(command),
            kill_policy: None,
            labels: Labels::default(),
        }
    }

    pub fn with_executor(mut self, executor: ExecutorInfo) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_kill_policy(mut self, policy: KillPolicy) -> Self {
        self.kill_policy = Some(policy);
        self
    }
}
