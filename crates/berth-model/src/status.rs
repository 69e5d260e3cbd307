use serde::{Deserialize, Serialize};

use crate::id::{AgentId, ExecutorId, FrameworkId, TaskId, UpdateUuid};
use crate::task::{TaskState, TaskStatus};

/// Status change travelling from the agent to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub status: TaskStatus,
    pub uuid: UpdateUuid,
    /// State the task is in now, which may be ahead of `status.state`
    /// while older updates are still being retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_state: Option<TaskState>,
}

impl StatusUpdate {
    /// Wraps `status`, reusing the sender's identifier when present.
    pub fn new(framework_id: FrameworkId, executor_id: Option<ExecutorId>, mut status: TaskStatus) -> Self {
        let uuid = *status.uuid.get_or_insert_with(UpdateUuid::random);
        Self {
            framework_id,
            executor_id,
            agent_id: None,
            status,
            uuid,
            latest_state: None,
        }
    }

    #[inline]
    pub fn task_id(&self) -> &TaskId {
        &self.status.task_id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.status.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Source;

    #[test]
    fn new_keeps_sender_uuid() {
        let uuid = UpdateUuid::random();
        let status = TaskStatus::new(TaskId::from("t"), TaskState::Running, Source::Executor).with_uuid(uuid);
        let update = StatusUpdate::new(FrameworkId::from("fw"), None, status);

        assert_eq!(update.uuid, uuid);
        assert_eq!(update.status.uuid, Some(uuid));
    }

    #[test]
    fn new_stamps_missing_uuid() {
        let status = TaskStatus::new(TaskId::from("t"), TaskState::Lost, Source::Agent);
        let update = StatusUpdate::new(FrameworkId::from("fw"), None, status);

        assert_eq!(update.status.uuid, Some(update.uuid));
        assert!(update.is_terminal());
    }
}
