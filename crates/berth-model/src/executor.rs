use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DurationMs, Labels};
use crate::id::ExecutorId;
use crate::resources::Resources;
use crate::task::{CommandInfo, TaskInfo};

/// Flavour of workload runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutorKind {
    /// Built-in executor that runs a single task's command.
    Command,
    /// Framework-supplied executor program.
    #[default]
    Custom,
}

/// Launch description for an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    #[serde(default)]
    pub kind: ExecutorKind,
    #[serde(default)]
    pub name: String,
    /// Program for custom executors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default)]
    pub resources: Resources,
    /// Overrides the agent-wide shutdown grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_period_ms: Option<DurationMs>,
    /// Overrides the agent-wide registration timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_timeout_ms: Option<DurationMs>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

impl ExecutorInfo {
    pub fn custom(executor_id: impl Into<ExecutorId>, command: CommandInfo, resources: Resources) -> Self {
        Self {
            executor_id: executor_id.into(),
            kind: ExecutorKind::Custom,
            name: String::new(),
            command: Some(command),
            resources,
            shutdown_grace_period_ms: None,
            registration_timeout_ms: None,
            labels: Labels::default(),
        }
    }

    /// Executor the agent synthesizes for a task that has none.
    ///
    /// The executor shares the task's identity.
    pub fn for_command_task(task: &TaskInfo) -> Self {
        Self {
            executor_id: ExecutorId::new(task.task_id.as_str()),
            kind: ExecutorKind::Command,
            name: format!("Command Executor (Task: {})", task.task_id),
            command: None,
            resources: Resources::default(),
            shutdown_grace_period_ms: None,
            registration_timeout_ms: None,
            labels: Labels::default(),
        }
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = Some(grace.as_millis() as DurationMs);
        self
    }

    pub fn shutdown_grace_period(&self) -> Option<Duration> {
        self.shutdown_grace_period_ms.map(Duration::from_millis)
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_ms = Some(timeout.as_millis() as DurationMs);
        self
    }

    pub fn registration_timeout(&self) -> Option<Duration> {
        self.registration_timeout_ms.map(Duration::from_millis)
    }
}
