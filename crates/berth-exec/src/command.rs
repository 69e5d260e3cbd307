//! In-process executor for tasks that bring only a command.
//!
//! It talks to the agent over the same executor message contract as any
//! other executor and runs its single task in a nested boundary.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use berth_core::agent::AgentHandle;
use berth_core::clock::ClockHandle;
use berth_core::collab::{ChannelExecutorLink, ContainerTermination, ExecutorLinkRef};
use berth_model::message::{ExecutorCommand, ExecutorMessage};
use berth_model::{
    ContainerId, Env, ExecutorId, FrameworkId, KillPolicy, Source, TaskId, TaskInfo, TaskState, TaskStatus,
    UpdateUuid,
};

use crate::hooks::{PreExecHook, RlimitConfig};
use crate::launcher::{LaunchRequest, LauncherRef, Redirect, describe_status, succeeded};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CommandOptions {
    /// Grace between `SIGTERM` and `SIGKILL` when the kill carries no policy.
    pub(crate) kill_grace: Duration,
    /// Resend period for updates the agent has not acknowledged.
    pub(crate) retry_interval: Duration,
}

pub(crate) struct CommandExecutor {
    pub(crate) agent: AgentHandle,
    pub(crate) launcher: LauncherRef,
    pub(crate) framework_id: FrameworkId,
    pub(crate) executor_id: ExecutorId,
    /// Nested boundary the task runs in.
    pub(crate) boundary: ContainerId,
    pub(crate) sandbox: PathBuf,
    pub(crate) env: Env,
    pub(crate) rlimits: RlimitConfig,
    pub(crate) hooks: Vec<PreExecHook>,
    pub(crate) options: CommandOptions,
    pub(crate) clock: ClockHandle,
}

enum Flow {
    Continue,
    Exit,
}

/// Mutable side of one executor run.
struct Run {
    link: ExecutorLinkRef,
    registered: bool,
    shutting_down: bool,
    task: Option<TaskInfo>,
    launched: bool,
    killing: bool,
    kill_deadline: Option<Instant>,
    terminal: Option<TaskState>,
    exit_status: Option<i32>,
    unacked: VecDeque<TaskStatus>,
    exits: mpsc::UnboundedSender<Option<i32>>,
}

impl CommandExecutor {
    /// Drives the executor until its task is done or `cancel` fires.
    #[instrument(name = "command_executor", skip_all, fields(framework = %self.framework_id, executor = %self.executor_id))]
    pub(crate) async fn run(self, cancel: CancellationToken) -> ContainerTermination {
        let (link, mut commands) = ChannelExecutorLink::new();
        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut run = Run {
            link,
            registered: false,
            shutting_down: false,
            task: None,
            launched: false,
            killing: false,
            kill_deadline: None,
            terminal: None,
            exit_status: None,
            unacked: VecDeque::new(),
            exits,
        };

        if !self.send(&run, ExecutorMessage::Register) {
            return self.finish(&run, "Agent went away before registration");
        }
        let period = self.options.retry_interval;
        let mut next_retry = self.clock.now() + period;

        loop {
            let deadline = run.kill_deadline;
            let flow = tokio::select! {
                _ = cancel.cancelled() => {
                    self.destroy_task().await;
                    return self.finish(&run, "Container destroyed");
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(&mut run, command).await,
                    None => Flow::Exit,
                },
                Some(status) = exited.recv() => self.on_task_exit(&mut run, status).await,
                _ = self.sleep_until(Some(next_retry)) => {
                    next_retry = self.clock.now() + period;
                    self.resend(&run);
                    Flow::Continue
                }
                _ = self.sleep_until(deadline), if deadline.is_some() => {
                    warn!("task outlived its kill grace period; destroying");
                    run.kill_deadline = None;
                    self.destroy_task().await;
                    Flow::Continue
                }
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        self.destroy_task().await;
        self.finish(&run, "Command executor exited")
    }

    async fn on_command(&self, run: &mut Run, command: ExecutorCommand) -> Flow {
        match command {
            ExecutorCommand::Registered { .. } | ExecutorCommand::Reregistered { .. } => {
                debug!("registered with agent");
                run.registered = true;
                Flow::Continue
            }
            ExecutorCommand::RunTask { task, .. } => {
                if !run.registered {
                    warn!(task = %task.task_id, "dropping launch received before registration");
                } else if let Some(current) = &run.task {
                    warn!(task = %task.task_id, current = %current.task_id, "already running a task; dropping launch");
                } else {
                    self.launch(run, task).await;
                }
                Flow::Continue
            }
            ExecutorCommand::RunTaskGroup { tasks, .. } => {
                for task in tasks {
                    warn!(task = %task.task_id, "task groups need a custom executor");
                    self.report(
                        run,
                        &task.task_id,
                        TaskState::Failed,
                        Some("The command executor cannot run task groups".into()),
                    );
                }
                Flow::Continue
            }
            ExecutorCommand::KillTask { task_id, kill_policy } => {
                self.kill(run, &task_id, kill_policy).await;
                self.exit_if_done(run)
            }
            ExecutorCommand::Acknowledged { task_id, uuid } => {
                run.unacked.retain(|s| s.uuid != Some(uuid));
                debug!(task = %task_id, uuid = %uuid, "update acknowledged");
                self.exit_if_done(run)
            }
            ExecutorCommand::Shutdown => {
                info!("shutdown requested");
                run.shutting_down = true;
                match run.task.as_ref().map(|t| t.task_id.clone()) {
                    Some(task_id) if run.terminal.is_none() => {
                        self.kill(run, &task_id, None).await;
                        Flow::Continue
                    }
                    _ => Flow::Exit,
                }
            }
        }
    }

    async fn launch(&self, run: &mut Run, task: TaskInfo) {
        let task_id = task.task_id.clone();
        run.task = Some(task.clone());

        let Some(command) = task.command.as_ref() else {
            self.report(run, &task_id, TaskState::Failed, Some("Task has no command".into()));
            self.mark_terminal(run, TaskState::Failed);
            return;
        };
        self.report(run, &task_id, TaskState::Starting, None);

        let mut request = LaunchRequest::from_command(command);
        request.env = self.env.merged(&command.env);
        if request.cwd.is_none() {
            request.cwd = Some(self.sandbox.clone());
        }
        request.stdout = Redirect::File(self.sandbox.join("stdout"));
        request.stderr = Redirect::File(self.sandbox.join("stderr"));
        request.rlimits = self.rlimits.clone();
        request.hooks = self.hooks.clone();

        match self.launcher.launch(&self.boundary, request).await {
            Ok(pid) => {
                info!(task = %task_id, pid, "task launched");
                run.launched = true;
                self.report(run, &task_id, TaskState::Running, None);

                let launcher = self.launcher.clone();
                let boundary = self.boundary.clone();
                let exits = run.exits.clone();
                tokio::spawn(async move {
                    let status = match launcher.wait(&boundary).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(container = %boundary, error = %e, "failed to wait for task");
                            None
                        }
                    };
                    let _ = exits.send(status);
                });
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "task launch failed");
                self.report(run, &task_id, TaskState::Failed, Some(format!("Failed to launch task: {e}")));
                self.mark_terminal(run, TaskState::Failed);
            }
        }
    }

    async fn kill(&self, run: &mut Run, task_id: &TaskId, policy: Option<KillPolicy>) {
        let Some(task) = run.task.as_ref().filter(|t| &t.task_id == task_id) else {
            warn!(task = %task_id, "kill for an unknown task");
            return;
        };
        if run.terminal.is_some() || run.killing {
            return;
        }
        if !run.launched {
            let task_id = task.task_id.clone();
            self.report(run, &task_id, TaskState::Killed, None);
            self.mark_terminal(run, TaskState::Killed);
            return;
        }

        let grace = policy
            .or(task.kill_policy)
            .map(|p| p.grace_period())
            .unwrap_or(self.options.kill_grace);
        info!(task = %task_id, grace = ?grace, "killing task");
        run.killing = true;
        if let Err(e) = self.launcher.terminate(&self.boundary).await {
            warn!(task = %task_id, error = %e, "failed to signal task");
        }
        run.kill_deadline = Some(self.clock.now() + grace);
    }

    async fn on_task_exit(&self, run: &mut Run, status: Option<i32>) -> Flow {
        let Some(task_id) = run.task.as_ref().map(|t| t.task_id.clone()) else {
            return Flow::Continue;
        };
        run.kill_deadline = None;
        run.exit_status = status;

        let (state, message) = match status {
            _ if run.killing => (TaskState::Killed, "Command was killed".to_string()),
            Some(raw) if succeeded(raw) => (TaskState::Finished, "Command exited with status 0".to_string()),
            Some(raw) => (TaskState::Failed, format!("Command {}", describe_status(raw))),
            None => (TaskState::Failed, "Command exit status was not observed".to_string()),
        };
        info!(task = %task_id, state = %state, "task exited");
        self.report(run, &task_id, state, Some(message));
        self.mark_terminal(run, state);
        self.destroy_task().await;
        self.exit_if_done(run)
    }

    fn mark_terminal(&self, run: &mut Run, state: TaskState) {
        run.terminal = Some(state);
        run.killing = false;
        run.kill_deadline = None;
    }

    /// Exits once the task is terminal and the agent holds every update,
    /// or right away when shutting down.
    fn exit_if_done(&self, run: &Run) -> Flow {
        match run.terminal {
            Some(_) if run.shutting_down || run.unacked.is_empty() => Flow::Exit,
            _ => Flow::Continue,
        }
    }

    fn report(&self, run: &mut Run, task_id: &TaskId, state: TaskState, message: Option<String>) {
        let mut status = TaskStatus::new(task_id.clone(), state, Source::Executor)
            .with_executor(self.executor_id.clone())
            .with_uuid(UpdateUuid::random());
        if let Some(message) = message {
            status = status.with_message(message);
        }
        run.unacked.push_back(status.clone());
        self.send(run, ExecutorMessage::StatusUpdate { status });
    }

    fn resend(&self, run: &Run) {
        for status in &run.unacked {
            debug!(task = %status.task_id, state = %status.state, "resending unacknowledged update");
            self.send(run, ExecutorMessage::StatusUpdate { status: status.clone() });
        }
    }

    fn send(&self, run: &Run, message: ExecutorMessage) -> bool {
        match self.agent.executor_message(
            self.framework_id.clone(),
            self.executor_id.clone(),
            message,
            Some(run.link.clone()),
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "agent unreachable");
                false
            }
        }
    }

    async fn destroy_task(&self) {
        if let Err(e) = self.launcher.destroy(&self.boundary).await {
            warn!(container = %self.boundary, error = %e, "failed to destroy task boundary");
        }
    }

    async fn sleep_until(&self, deadline: Option<Instant>) {
        match deadline {
            Some(at) => self.clock.sleep(at.saturating_duration_since(self.clock.now())).await,
            None => std::future::pending().await,
        }
    }

    fn finish(&self, run: &Run, message: &str) -> ContainerTermination {
        debug!(status = ?run.exit_status, "{message}");
        ContainerTermination {
            status: run.exit_status,
            message: Some(message.to_string()),
        }
    }
}
