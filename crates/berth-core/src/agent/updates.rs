use tracing::{debug, trace, warn};

use berth_model::message::AgentMessage;
use berth_model::{ExecutorId, FrameworkId, StatusUpdate, TaskId, TaskStatus, UpdateUuid};

use super::actor::AgentActor;
use super::handle::UpdatePurpose;
use super::state::{AgentState, ExecutorState, FrameworkState};
use crate::status_update::StatusUpdateError;

/// What became of a status handed to [`AgentActor::status_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// Durable and queued for the controller.
    Accepted,
    /// Seen before; the sender may be acknowledged again.
    Duplicate,
    Rejected,
}

impl AgentActor {
    /// Single entry point for every status, whether an executor sent it or
    /// the agent produced it.
    pub(crate) async fn status_update(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: Option<&ExecutorId>,
        mut status: TaskStatus,
    ) -> Recorded {
        if status.timestamp == 0.0 {
            status.timestamp = self.io.clock.timestamp();
        }
        if status.executor_id.is_none() {
            status.executor_id = executor_id.cloned();
        }
        let mut update = StatusUpdate::new(framework_id.clone(), executor_id.cloned(), status);
        update.agent_id = self.agent_id.clone();
        let task_id = update.task_id().clone();
        let state = update.state();

        let Some(fw) = self.frameworks.get(framework_id) else {
            warn!(framework = %framework_id, task = %task_id, "status update for unknown framework");
            return Recorded::Rejected;
        };
        if fw.state == FrameworkState::Terminating {
            debug!(framework = %framework_id, task = %task_id, state = %state, "ignoring status update for terminating framework");
            return Recorded::Rejected;
        }
        let checkpoint = fw.info.checkpoint;
        match fw.task(&task_id) {
            Some(task) if task.state.is_terminal() => {
                debug!(task = %task_id, current = %task.state, state = %state, "task is already terminal");
                return Recorded::Duplicate;
            }
            Some(_) => {}
            None => warn!(framework = %framework_id, task = %task_id, state = %state, "status update for unknown task"),
        }

        let uuid = update.uuid;
        match self.sum.update(update, checkpoint).await {
            Ok(()) => {}
            Err(StatusUpdateError::Duplicate { .. } | StatusUpdateError::Terminated { .. }) => {
                debug!(task = %task_id, uuid = %uuid, "duplicate status update");
                return Recorded::Duplicate;
            }
            Err(e) => {
                warn!(task = %task_id, uuid = %uuid, error = %e, "status update rejected");
                return Recorded::Rejected;
            }
        }

        let Some(fw) = self.frameworks.get_mut(framework_id) else {
            return Recorded::Accepted;
        };
        if let Some(task) = fw.task_mut(&task_id) {
            task.record_update(state, uuid);
        }
        if !state.is_terminal() {
            return Recorded::Accepted;
        }

        self.metrics.record_task_terminal(state);
        let mut release = None;
        if let Some(exec_id) = fw.executor_of(&task_id).cloned() {
            if let Some(exec) = fw.executors.get_mut(&exec_id) {
                let forwarded = exec.tasks.get(&task_id).is_some_and(|t| t.forwarded);
                exec.retire_task(&task_id);
                if forwarded && exec.state == ExecutorState::Running {
                    release = Some((exec_id, exec.container_id.clone(), exec.allocated()));
                }
            }
        }
        if let Some((exec_id, container_id, resources)) = release {
            self.io.update(
                framework_id.clone(),
                exec_id,
                container_id,
                resources,
                UpdatePurpose::Release { task_id },
            );
        }
        Recorded::Accepted
    }

    /// Sends an update the status update manager decided to (re)deliver.
    pub(crate) fn on_forward(&mut self, mut update: StatusUpdate) {
        if self.state != AgentState::Running {
            trace!(task = %update.task_id(), "not registered; update stays queued");
            return;
        }
        let Some(leader) = self.leader.clone() else {
            return;
        };
        if let Some(task) = self
            .frameworks
            .get(&update.framework_id)
            .and_then(|f| f.task(update.task_id()))
        {
            update.latest_state = Some(task.state);
        }
        self.io.send(Some(&leader), AgentMessage::StatusUpdate { update });
    }

    pub(crate) async fn on_acknowledgement(&mut self, framework_id: FrameworkId, task_id: TaskId, uuid: UpdateUuid) {
        let outcome = match self.sum.acknowledge(framework_id.clone(), task_id.clone(), uuid).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_invalid_acknowledgement();
                warn!(framework = %framework_id, task = %task_id, uuid = %uuid, error = %e, "invalid acknowledgement");
                return;
            }
        };
        debug!(framework = %framework_id, task = %task_id, uuid = %uuid, terminal = outcome.terminal, "status update acknowledged");

        if let Some(task) = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|f| f.task_mut(&task_id))
        {
            task.record_ack(uuid);
        }
        if outcome.terminal {
            self.complete_task(&framework_id, &task_id).await;
        }
    }

    /// Moves a fully acknowledged terminal task to the completed list and
    /// drops whatever became empty around it.
    async fn complete_task(&mut self, framework_id: &FrameworkId, task_id: &TaskId) {
        let max = self.config.max_completed_tasks_per_executor;
        let Some(fw) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        if fw.unrouted.remove(task_id).is_none() {
            if let Some(exec_id) = fw.executor_of(task_id).cloned() {
                if let Some(exec) = fw.executors.get_mut(&exec_id) {
                    exec.complete_task(task_id, max);
                }
                self.retire_executor_if_done(framework_id, &exec_id).await;
            }
        }
        self.maybe_remove_framework(framework_id).await;
    }
}
