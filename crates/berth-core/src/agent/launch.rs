use std::path::PathBuf;

use tracing::{debug, info, warn};

use berth_model::message::{AgentMessage, ExecutorCommand};
use berth_model::{
    ContainerId, Env, ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, Reason, ResourceVersionEntry, Resources,
    TaskId, TaskInfo, TaskState, TaskStatus,
};

use super::actor::AgentActor;
use super::handle::{AgentEvent, PreparedLaunch, UpdatePurpose};
use super::state::{
    AgentState, Executor, ExecutorState, Framework, FrameworkState, LaunchUnit, PendingTask, PendingTermination, Task,
};
use crate::collab::{AUTHENTICATION_TOKEN_ENV, ContainerConfig};
use crate::metrics::LaunchErrorKind;
use crate::paths;

impl AgentActor {
    pub(crate) async fn on_run_task(
        &mut self,
        framework: FrameworkInfo,
        task: TaskInfo,
        resource_versions: Vec<ResourceVersionEntry>,
    ) {
        let executor = task
            .executor
            .clone()
            .unwrap_or_else(|| ExecutorInfo::for_command_task(&task));
        self.begin_launch(PreparedLaunch {
            framework,
            executor,
            tasks: vec![task],
            group: false,
            resource_versions,
        })
        .await;
    }

    pub(crate) async fn on_run_task_group(
        &mut self,
        framework: FrameworkInfo,
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
        resource_versions: Vec<ResourceVersionEntry>,
    ) {
        if tasks.is_empty() {
            warn!(framework = %framework.id, executor = %executor.executor_id, "ignoring empty task group");
            return;
        }
        self.begin_launch(PreparedLaunch {
            framework,
            executor,
            tasks,
            group: true,
            resource_versions,
        })
        .await;
    }

    async fn begin_launch(&mut self, launch: PreparedLaunch) {
        let framework_id = launch.framework.id.clone();
        let task_ids: Vec<TaskId> = launch.tasks.iter().map(|t| t.task_id.clone()).collect();
        if self.state != AgentState::Running {
            warn!(framework = %framework_id, tasks = ?task_ids, state = ?self.state, "agent is not registered; dropping launch");
            return;
        }

        let created = !self.frameworks.contains_key(&framework_id);
        let fw = self
            .frameworks
            .entry(framework_id.clone())
            .or_insert_with(|| Framework::new(launch.framework.clone()));
        if fw.state == FrameworkState::Terminating {
            warn!(framework = %framework_id, tasks = ?task_ids, "framework is terminating; dropping launch");
            return;
        }
        if let Some(known) = task_ids.iter().find(|id| fw.knows(id)) {
            warn!(framework = %framework_id, task = %known, "task id already in use; dropping launch");
            return;
        }
        fw.info = launch.framework.clone();
        let needs_executor = !fw.executors.contains_key(&launch.executor.executor_id);

        if created && launch.framework.checkpoint {
            if let Some(store) = &self.store {
                if let Err(e) = store.checkpoint_framework(&launch.framework).await {
                    warn!(framework = %framework_id, error = %e, "failed to checkpoint framework");
                }
            }
        }

        if needs_executor && self.io.secrets.is_some() {
            if let Some(fw) = self.frameworks.get_mut(&framework_id) {
                for task in &launch.tasks {
                    fw.pending.insert(
                        task.task_id.clone(),
                        PendingTask {
                            info: task.clone(),
                            executor_id: launch.executor.executor_id.clone(),
                            siblings: task_ids.clone(),
                        },
                    );
                }
            }
            debug!(framework = %framework_id, executor = %launch.executor.executor_id, "generating executor secret");
            self.io.generate_secret(launch);
            return;
        }
        self.launch_prepared(launch, None).await;
    }

    pub(crate) async fn on_secret_generated(&mut self, mut launch: PreparedLaunch, result: Result<Vec<u8>, String>) {
        let framework_id = launch.framework.id.clone();
        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        launch.tasks.retain(|t| {
            let parked = fw.pending.remove(&t.task_id).is_some();
            if !parked {
                debug!(task = %t.task_id, "task was killed while its executor secret was generated");
            }
            parked
        });
        if launch.tasks.is_empty() {
            self.maybe_remove_framework(&framework_id).await;
            return;
        }

        match result {
            Ok(token) => self.launch_prepared(launch, Some(token)).await,
            Err(message) => {
                let executor_id = launch.executor.executor_id.clone();
                self.metrics.record_launch_error(LaunchErrorKind::SecretGeneration);
                warn!(framework = %framework_id, executor = %executor_id, error = %message, "executor secret generation failed");

                for task in launch.tasks {
                    self.fail_unrouted(
                        &framework_id,
                        &executor_id,
                        task,
                        TaskState::Failed,
                        Reason::ContainerLaunchFailed,
                        &message,
                    )
                    .await;
                }
                self.io.send(
                    self.leader.as_ref(),
                    AgentMessage::ExitedExecutor {
                        agent_id: self.agent_id.clone(),
                        framework_id: framework_id.clone(),
                        executor_id,
                        status: None,
                    },
                );
                self.maybe_remove_framework(&framework_id).await;
            }
        }
    }

    /// Records a task that never reached an executor and reports it.
    async fn fail_unrouted(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task: TaskInfo,
        state: TaskState,
        reason: Reason,
        message: &str,
    ) {
        let task_id = task.task_id.clone();
        let Some(fw) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        fw.unrouted.insert(task_id.clone(), Task::new(task));
        // No executor run exists, so the update is not persisted under one.
        let status = self
            .io
            .status(task_id, state, reason, message)
            .with_executor(executor_id.clone());
        self.status_update(framework_id, None, status).await;
    }

    /// Routes a launch whose secret (if any) is ready onto its executor.
    async fn launch_prepared(&mut self, launch: PreparedLaunch, token: Option<Vec<u8>>) {
        let PreparedLaunch {
            framework,
            executor,
            tasks,
            group,
            resource_versions,
        } = launch;
        let framework_id = framework.id.clone();
        let executor_id = executor.executor_id.clone();
        let Some(fw) = self.frameworks.get(&framework_id) else {
            return;
        };
        let dropped = fw.dropped_state();

        let mut requested = Resources::sum(tasks.iter().map(|t| &t.resources));
        requested.add(&executor.resources);
        if let Err(message) = self.versions.validate(&requested, &resource_versions) {
            self.metrics.record_launch_error(LaunchErrorKind::InvalidOffers);
            warn!(framework = %framework_id, executor = %executor_id, error = %message, "launch built on stale resources");
            for task in tasks {
                self.fail_unrouted(&framework_id, &executor_id, task, dropped, Reason::InvalidOffers, &message)
                    .await;
            }
            self.maybe_remove_framework(&framework_id).await;
            return;
        }

        match fw.executors.get(&executor_id).map(|e| e.state) {
            Some(ExecutorState::Terminating | ExecutorState::Terminated) => {
                warn!(framework = %framework_id, executor = %executor_id, "executor is shutting down; dropping launch");
                for task in tasks {
                    self.fail_unrouted(
                        &framework_id,
                        &executor_id,
                        task,
                        dropped,
                        Reason::ExecutorTerminated,
                        "Executor is terminating",
                    )
                    .await;
                }
                return;
            }
            Some(_) => {}
            None => self.create_executor(&framework, executor, token).await,
        }

        let checkpoint = framework.checkpoint;
        let Some(exec) = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|f| f.executors.get_mut(&executor_id))
        else {
            return;
        };
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.task_id.clone()).collect();
        for task in &tasks {
            exec.tasks.insert(task.task_id.clone(), Task::new(task.clone()));
        }
        exec.queue.push(LaunchUnit {
            task_ids: task_ids.clone(),
            group,
        });
        let running = exec.state == ExecutorState::Running;
        info!(framework = %framework_id, executor = %executor_id, tasks = ?task_ids, "queued launch");

        if checkpoint {
            if let Some(store) = &self.store {
                for task in &tasks {
                    if let Err(e) = store.checkpoint_task(&framework_id, &executor_id, task).await {
                        warn!(task = %task.task_id, error = %e, "failed to checkpoint task");
                    }
                }
            }
        }
        if running {
            self.flush(&framework_id, &executor_id);
        }
    }

    async fn create_executor(&mut self, framework: &FrameworkInfo, executor: ExecutorInfo, token: Option<Vec<u8>>) {
        let framework_id = framework.id.clone();
        let executor_id = executor.executor_id.clone();
        let container_id = ContainerId::random();

        let mut env = Env::new();
        if let Some(token) = token {
            env.push(AUTHENTICATION_TOKEN_ENV, String::from_utf8_lossy(&token));
        }
        let config = ContainerConfig {
            framework: framework.clone(),
            executor: executor.clone(),
            agent_id: self.agent_id.clone(),
            resources: executor.resources.clone(),
            env,
            sandbox: self.sandbox(&framework_id, &executor_id, &container_id),
            checkpoint: framework.checkpoint,
        };

        let timeout = executor
            .registration_timeout()
            .unwrap_or_else(|| self.config.executor_registration_timeout());
        let mut exec = Executor::new(executor.clone(), framework_id.clone(), container_id.clone());
        exec.registration_timer = Some(self.io.after(
            timeout,
            AgentEvent::ExecutorRegistrationTimeout {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                container_id: container_id.clone(),
            },
        ));

        if framework.checkpoint {
            if let Some(store) = &self.store {
                if let Err(e) = store.checkpoint_executor(&framework_id, &executor, &container_id).await {
                    warn!(executor = %executor_id, error = %e, "failed to checkpoint executor");
                }
            }
        }
        if let Some(fw) = self.frameworks.get_mut(&framework_id) {
            fw.executors.insert(executor_id.clone(), exec);
        }
        info!(framework = %framework_id, executor = %executor_id, container = %container_id, "launching executor");
        self.io.launch(framework_id, executor_id, container_id, config);
    }

    fn sandbox(&self, framework_id: &FrameworkId, executor_id: &ExecutorId, container_id: &ContainerId) -> PathBuf {
        let runs = self
            .config
            .work_dir
            .join("frameworks")
            .join(framework_id.as_str())
            .join("executors")
            .join(executor_id.as_str())
            .join("runs");
        paths::container_path(&runs, container_id)
    }

    /// Grows the grant of a running executor to cover its queued units, which
    /// are forwarded once the containerizer confirms.
    pub(crate) fn flush(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let Some(exec) = self
            .frameworks
            .get_mut(framework_id)
            .and_then(|f| f.executors.get_mut(executor_id))
        else {
            return;
        };
        if exec.state != ExecutorState::Running || exec.queue.is_empty() {
            return;
        }
        let units = std::mem::take(&mut exec.queue);
        let resources = exec.allocated();
        let container_id = exec.container_id.clone();
        self.io.update(
            framework_id.clone(),
            executor_id.clone(),
            container_id,
            resources,
            UpdatePurpose::Flush { units },
        );
    }

    pub(crate) async fn on_container_updated(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        purpose: UpdatePurpose,
        result: Result<(), String>,
    ) {
        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let collateral = fw.collateral_state();
        let framework = fw.info.clone();
        let Some(exec) = fw.executors.get_mut(&executor_id) else {
            return;
        };
        if exec.container_id != container_id {
            return;
        }

        if let Err(message) = result {
            self.metrics.record_launch_error(LaunchErrorKind::ContainerUpdate);
            warn!(framework = %framework_id, executor = %executor_id, container = %container_id, error = %message, "container update failed");
            if matches!(exec.state, ExecutorState::Terminating | ExecutorState::Terminated) {
                return;
            }
            exec.pending_termination = Some(PendingTermination {
                state: collateral,
                reason: Reason::ContainerUpdateFailed,
                message: format!("Failed to update resources for container: {message}"),
            });
            exec.state = ExecutorState::Terminating;
            exec.cancel_timers();
            self.io.destroy(container_id);
            return;
        }

        let UpdatePurpose::Flush { units } = purpose else {
            return;
        };
        if exec.state != ExecutorState::Running {
            // Tasks stay live and are resolved when the container exits.
            return;
        }

        let mut killed = Vec::new();
        for unit in units {
            let ids: Vec<TaskId> = unit
                .task_ids
                .into_iter()
                .filter(|id| exec.tasks.contains_key(id))
                .collect();
            if ids.is_empty() {
                continue;
            }
            if ids
                .iter()
                .any(|id| exec.tasks.get(id).is_some_and(|t| t.kill_requested))
            {
                killed.extend(ids);
                continue;
            }

            let mut infos = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(task) = exec.tasks.get_mut(id) {
                    task.forwarded = true;
                    infos.push(task.info.clone());
                }
            }
            let command = if unit.group {
                ExecutorCommand::RunTaskGroup {
                    framework: framework.clone(),
                    tasks: infos,
                }
            } else {
                let Some(task) = infos.into_iter().next() else {
                    continue;
                };
                ExecutorCommand::RunTask {
                    framework: framework.clone(),
                    task,
                }
            };
            if exec.send(command) {
                info!(framework = %framework_id, executor = %executor_id, tasks = ?ids, "forwarded tasks to executor");
            } else {
                warn!(framework = %framework_id, executor = %executor_id, tasks = ?ids, "executor is disconnected; tasks resolve when it exits");
            }
        }

        for task_id in killed {
            let status = self.io.status(
                task_id,
                TaskState::Killed,
                Reason::TaskKilledDuringLaunch,
                "Task killed before delivery to the executor",
            );
            self.status_update(&framework_id, Some(&executor_id), status).await;
        }
    }

    pub(crate) async fn on_kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) {
        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework = %framework_id, task = %task_id, "kill for unknown framework");
            return;
        };

        if let Some(pending) = fw.pending.get(&task_id).cloned() {
            let parked: Vec<PendingTask> = pending
                .siblings
                .iter()
                .filter_map(|id| fw.pending.remove(id))
                .collect();
            info!(framework = %framework_id, task = %task_id, tasks = parked.len(), "killing launch before its executor exists");
            for p in parked {
                self.fail_unrouted(
                    &framework_id,
                    &p.executor_id,
                    p.info,
                    TaskState::Killed,
                    Reason::TaskKilledDuringLaunch,
                    "Task killed before its executor was launched",
                )
                .await;
            }
            return;
        }

        let Some(executor_id) = fw.executor_of(&task_id).cloned() else {
            if fw.unrouted.contains_key(&task_id) {
                debug!(task = %task_id, "kill for a task that never launched; nothing to do");
            } else {
                warn!(framework = %framework_id, task = %task_id, "kill for unknown task");
            }
            return;
        };
        let Some(exec) = fw.executors.get_mut(&executor_id) else {
            return;
        };
        let Some((forwarded, kill_requested, kill_policy)) = exec
            .tasks
            .get(&task_id)
            .map(|t| (t.forwarded, t.kill_requested, t.info.kill_policy))
        else {
            debug!(task = %task_id, "kill for a terminal task; nothing to do");
            return;
        };

        if let Some(unit) = exec.dequeue_unit(&task_id) {
            info!(framework = %framework_id, executor = %executor_id, tasks = ?unit.task_ids, "killing queued launch");
            let statuses: Vec<TaskStatus> = unit
                .task_ids
                .into_iter()
                .map(|id| {
                    self.io.status(
                        id,
                        TaskState::Killed,
                        Reason::TaskKilledDuringLaunch,
                        "Task killed before delivery to the executor",
                    )
                })
                .collect();
            for status in statuses {
                self.status_update(&framework_id, Some(&executor_id), status).await;
            }

            let idle_registering = self
                .frameworks
                .get(&framework_id)
                .and_then(|f| f.executors.get(&executor_id))
                .is_some_and(|e| e.state == ExecutorState::Registering && e.tasks.is_empty());
            if idle_registering {
                self.shutdown_executor(&framework_id, &executor_id);
            }
            return;
        }

        if kill_requested {
            debug!(task = %task_id, "kill already requested");
            return;
        }
        if let Some(task) = exec.tasks.get_mut(&task_id) {
            task.kill_requested = true;
        }
        if !forwarded {
            debug!(task = %task_id, "kill recorded; launch is in flight");
            return;
        }
        if exec.send(ExecutorCommand::KillTask {
            task_id: task_id.clone(),
            kill_policy,
        }) {
            info!(framework = %framework_id, executor = %executor_id, task = %task_id, "asked executor to kill task");
        } else {
            debug!(task = %task_id, "executor is disconnected; kill replays when it re-registers");
        }
    }

    /// Asks an executor to stop, then destroys its container after the grace
    /// period. Executors without a channel are destroyed right away.
    pub(crate) fn shutdown_executor(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let default_grace = self.config.executor_shutdown_grace_period();
        let Some(exec) = self
            .frameworks
            .get_mut(framework_id)
            .and_then(|f| f.executors.get_mut(executor_id))
        else {
            warn!(framework = %framework_id, executor = %executor_id, "shutdown for unknown executor");
            return;
        };
        if matches!(exec.state, ExecutorState::Terminating | ExecutorState::Terminated) {
            return;
        }
        exec.state = ExecutorState::Terminating;
        exec.registration_timer = None;

        if exec.send(ExecutorCommand::Shutdown) {
            let grace = exec.info.shutdown_grace_period().unwrap_or(default_grace);
            info!(framework = %framework_id, executor = %executor_id, grace = ?grace, "shutting down executor");
            exec.shutdown_timer = Some(self.io.after(
                grace,
                AgentEvent::ExecutorShutdownTimeout {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    container_id: exec.container_id.clone(),
                },
            ));
        } else {
            info!(framework = %framework_id, executor = %executor_id, "destroying executor without a channel");
            self.io.destroy(exec.container_id.clone());
        }
    }

    pub(crate) async fn on_shutdown_framework(&mut self, framework_id: FrameworkId) {
        let Some(fw) = self.frameworks.get_mut(&framework_id) else {
            debug!(framework = %framework_id, "shutdown for unknown framework");
            return;
        };
        if fw.state == FrameworkState::Terminating {
            return;
        }
        info!(framework = %framework_id, "shutting down framework");
        fw.state = FrameworkState::Terminating;
        fw.pending.clear();
        fw.unrouted.clear();
        for exec in fw.executors.values_mut() {
            exec.terminated.clear();
        }
        let executor_ids: Vec<ExecutorId> = fw.executors.keys().cloned().collect();
        self.sum.cleanup(framework_id.clone());

        for executor_id in &executor_ids {
            self.shutdown_executor(&framework_id, executor_id);
            self.retire_executor_if_done(&framework_id, executor_id).await;
        }
        self.maybe_remove_framework(&framework_id).await;
    }

    pub(crate) async fn on_update_framework(&mut self, framework: FrameworkInfo) {
        let Some(fw) = self.frameworks.get_mut(&framework.id) else {
            debug!(framework = %framework.id, "update for unknown framework");
            return;
        };
        fw.info = framework.clone();
        info!(framework = %framework.id, "framework updated");
        if framework.checkpoint {
            if let Some(store) = &self.store {
                if let Err(e) = store.checkpoint_framework(&framework).await {
                    warn!(framework = %framework.id, error = %e, "failed to checkpoint framework");
                }
            }
        }
    }
}
