use tracing::{debug, info, warn};

use berth_model::message::{AgentMessage, ExecutorCommand, ExecutorMessage};
use berth_model::{ContainerId, ExecutorId, FrameworkId, Reason, TaskInfo, TaskState, TaskStatus, UpdateUuid};

use super::actor::AgentActor;
use super::state::{AgentState, ExecutorState, FrameworkState, PendingTermination, Task};
use super::updates::Recorded;
use crate::collab::{ContainerTermination, ExecutorLinkRef};
use crate::metrics::LaunchErrorKind;

impl AgentActor {
    pub(crate) async fn on_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        message: ExecutorMessage,
        link: Option<ExecutorLinkRef>,
    ) {
        match message {
            ExecutorMessage::Register => self.on_executor_register(framework_id, executor_id, link),
            ExecutorMessage::Reregister { tasks, updates } => {
                self.on_executor_reregister(framework_id, executor_id, tasks, updates, link)
                    .await
            }
            ExecutorMessage::StatusUpdate { status } => {
                self.on_executor_status(framework_id, executor_id, status, link)
                    .await
            }
        }
    }

    fn on_executor_register(&mut self, framework_id: FrameworkId, executor_id: ExecutorId, link: Option<ExecutorLinkRef>) {
        let Some(link) = link else {
            warn!(framework = %framework_id, executor = %executor_id, "executor registered without a channel");
            return;
        };
        let retry = self.config.executor_reregistration_retry;
        let agent_id = self.agent_id.clone();

        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework = %framework_id, executor = %executor_id, "registration from executor of unknown framework");
            refuse(&link);
            return;
        };
        let terminating = fw.state == FrameworkState::Terminating;
        let framework = fw.info.clone();
        let Some(exec) = fw.executors.get_mut(&executor_id) else {
            warn!(framework = %framework_id, executor = %executor_id, "registration from unknown executor");
            refuse(&link);
            return;
        };

        match exec.state {
            ExecutorState::Registering => {}
            ExecutorState::Running if retry => {
                debug!(executor = %executor_id, "ignoring duplicate executor registration");
                return;
            }
            state => {
                warn!(executor = %executor_id, state = ?state, "unexpected executor registration; shutting it down");
                refuse(&link);
                return;
            }
        }

        exec.state = ExecutorState::Running;
        exec.link = Some(link);
        exec.registration_timer = None;
        let executor = exec.info.clone();
        if !exec.send(ExecutorCommand::Registered {
            agent_id,
            framework,
            executor,
        }) {
            return;
        }
        info!(framework = %framework_id, executor = %executor_id, "executor registered");

        if terminating {
            self.shutdown_executor(&framework_id, &executor_id);
        } else {
            self.flush(&framework_id, &executor_id);
        }
    }

    /// Accepts an executor that outlived an agent restart or lost its channel.
    async fn on_executor_reregister(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        updates: Vec<TaskStatus>,
        link: Option<ExecutorLinkRef>,
    ) {
        let Some(link) = link else {
            warn!(framework = %framework_id, executor = %executor_id, "executor re-registered without a channel");
            return;
        };
        let retry = self.config.executor_reregistration_retry;
        let recovering = self.state == AgentState::Recovering;
        let agent_id = self.agent_id.clone();

        let Some(exec) = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|f| f.executors.get_mut(&executor_id))
        else {
            warn!(framework = %framework_id, executor = %executor_id, "re-registration from unknown executor");
            refuse(&link);
            return;
        };

        let recovered = recovering && exec.recovered && !exec.reregistered && exec.state == ExecutorState::Registering;
        let reconnecting = !recovering && exec.state == ExecutorState::Running && exec.link.is_none();
        if !recovered && !reconnecting {
            if retry {
                debug!(executor = %executor_id, "ignoring duplicate executor re-registration");
            } else {
                warn!(executor = %executor_id, state = ?exec.state, "unexpected executor re-registration; shutting it down");
                refuse(&link);
            }
            return;
        }

        exec.reregistered = true;
        exec.state = ExecutorState::Running;
        exec.link = Some(link.clone());
        exec.registration_timer = None;
        if !exec.send(ExecutorCommand::Reregistered { agent_id }) {
            return;
        }
        info!(framework = %framework_id, executor = %executor_id, tasks = tasks.len(), "executor re-registered");

        for info in tasks {
            if exec.task(&info.task_id).is_none() {
                let mut task = Task::new(info);
                task.forwarded = true;
                exec.tasks.insert(task.id().clone(), task);
            }
        }
        let kills: Vec<_> = exec
            .tasks
            .values()
            .filter(|t| t.kill_requested)
            .map(|t| (t.id().clone(), t.info.kill_policy))
            .collect();
        for (task_id, kill_policy) in kills {
            debug!(task = %task_id, "replaying kill to re-registered executor");
            exec.send(ExecutorCommand::KillTask { task_id, kill_policy });
        }

        for status in updates {
            self.on_executor_status(framework_id.clone(), executor_id.clone(), status, Some(link.clone()))
                .await;
        }
        if recovering && self.all_reregistered() {
            info!("every recovered executor re-registered");
            self.on_reregistration_timeout();
        }
    }

    async fn on_executor_status(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        mut status: TaskStatus,
        link: Option<ExecutorLinkRef>,
    ) {
        let known = self
            .frameworks
            .get(&framework_id)
            .is_some_and(|f| f.executors.contains_key(&executor_id));
        if !known {
            warn!(framework = %framework_id, executor = %executor_id, task = %status.task_id, "status update from unknown executor");
            return;
        }
        let uuid = *status.uuid.get_or_insert_with(UpdateUuid::random);
        let task_id = status.task_id.clone();

        match self.status_update(&framework_id, Some(&executor_id), status).await {
            Recorded::Accepted | Recorded::Duplicate => {}
            Recorded::Rejected => return,
        }

        let ack = ExecutorCommand::Acknowledged { task_id, uuid };
        match link {
            Some(link) => {
                if let Err(e) = link.send(ack) {
                    debug!(executor = %executor_id, error = %e, "could not acknowledge executor");
                }
            }
            None => {
                if let Some(exec) = self
                    .frameworks
                    .get_mut(&framework_id)
                    .and_then(|f| f.executors.get_mut(&executor_id))
                {
                    exec.send(ack);
                }
            }
        }
    }

    pub(crate) fn on_executor_registration_timeout(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) {
        let default_timeout = self.config.executor_registration_timeout();
        let Some(exec) = self
            .frameworks
            .get_mut(framework_id)
            .and_then(|f| f.executors.get_mut(executor_id))
        else {
            return;
        };
        if &exec.container_id != container_id || exec.state != ExecutorState::Registering {
            return;
        }
        let timeout = exec.info.registration_timeout().unwrap_or(default_timeout);
        warn!(framework = %framework_id, executor = %executor_id, timeout = ?timeout, "executor did not register in time");

        exec.pending_termination = Some(PendingTermination {
            state: TaskState::Failed,
            reason: Reason::ExecutorRegistrationTimeout,
            message: format!("Executor did not register within {timeout:?}"),
        });
        exec.state = ExecutorState::Terminating;
        exec.registration_timer = None;
        self.io.destroy(container_id.clone());
    }

    pub(crate) fn on_executor_shutdown_timeout(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) {
        let Some(exec) = self
            .frameworks
            .get(framework_id)
            .and_then(|f| f.executors.get(executor_id))
        else {
            return;
        };
        if &exec.container_id != container_id || exec.state != ExecutorState::Terminating {
            return;
        }
        warn!(framework = %framework_id, executor = %executor_id, "executor outlived its shutdown grace period; destroying");
        self.io.destroy(container_id.clone());
    }

    pub(crate) fn on_container_launched(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        result: Result<(), String>,
    ) {
        let exec = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|f| f.executors.get_mut(&executor_id))
            .filter(|e| e.container_id == container_id);

        match (result, exec) {
            (Ok(()), Some(exec)) => match exec.state {
                // Killed while the launch was in flight; the earlier destroy found no container.
                ExecutorState::Terminating if exec.link.is_none() => {
                    debug!(framework = %framework_id, executor = %executor_id, container = %container_id, "container launched after its executor was terminated");
                    self.io.destroy_and_report(framework_id, executor_id, container_id);
                }
                ExecutorState::Terminated => self.io.destroy(container_id),
                _ => {
                    debug!(framework = %framework_id, executor = %executor_id, container = %container_id, "container launched");
                    self.io.wait(framework_id, executor_id, container_id);
                }
            },
            (Ok(()), None) => {
                debug!(container = %container_id, "launched container no longer wanted");
                self.io.destroy(container_id);
            }
            (Err(message), exec) => {
                self.metrics.record_launch_error(LaunchErrorKind::ContainerLaunch);
                warn!(framework = %framework_id, executor = %executor_id, container = %container_id, error = %message, "container launch failed");
                let Some(exec) = exec else {
                    self.io.destroy(container_id);
                    return;
                };
                exec.pending_termination = Some(PendingTermination {
                    state: TaskState::Failed,
                    reason: Reason::ContainerLaunchFailed,
                    message: format!("Failed to launch container: {message}"),
                });
                exec.state = ExecutorState::Terminating;
                exec.registration_timer = None;
                self.io.destroy_and_report(framework_id, executor_id, container_id);
            }
        }
    }

    pub(crate) async fn on_container_exited(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        termination: Option<ContainerTermination>,
    ) {
        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let terminating = fw.state == FrameworkState::Terminating;
        let Some(exec) = fw.executors.get_mut(&executor_id) else {
            return;
        };
        if exec.container_id != container_id || exec.state == ExecutorState::Terminated {
            return;
        }

        let termination = termination.unwrap_or_default();
        info!(
            framework = %framework_id,
            executor = %executor_id,
            container = %container_id,
            status = ?termination.status,
            "executor terminated"
        );
        exec.state = ExecutorState::Terminated;
        exec.cancel_timers();
        exec.link = None;

        let task_ids = exec.live_task_ids();
        exec.queue.clear();
        let mut statuses = Vec::new();
        if terminating {
            for id in &task_ids {
                exec.tasks.remove(id);
            }
        } else {
            let (state, reason, message) = match exec.pending_termination.take() {
                Some(p) => (p.state, p.reason, p.message),
                None => (
                    TaskState::Failed,
                    Reason::ExecutorTerminated,
                    termination
                        .message
                        .clone()
                        .unwrap_or_else(|| "Executor terminated".to_string()),
                ),
            };
            for id in task_ids {
                statuses.push(self.io.status(id, state, reason, message.clone()));
            }
        }

        self.metrics.record_executor_terminated();
        self.io.send(
            self.leader.as_ref(),
            AgentMessage::ExitedExecutor {
                agent_id: self.agent_id.clone(),
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                status: termination.status,
            },
        );

        for status in statuses {
            self.status_update(&framework_id, Some(&executor_id), status).await;
        }
        self.retire_executor_if_done(&framework_id, &executor_id).await;
        self.maybe_remove_framework(&framework_id).await;
    }
}

fn refuse(link: &ExecutorLinkRef) {
    if let Err(e) = link.send(ExecutorCommand::Shutdown) {
        debug!(error = %e, "could not send shutdown to refused executor");
    }
}
