use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use berth_core::agent::AgentHandle;
use berth_core::clock::{ClockHandle, tokio_clock};
use berth_core::collab::{ContainerConfig, ContainerStatus, ContainerTermination, Containerizer, ResourceStatistics};
use berth_core::error::CoreError;
use berth_model::{ContainerId, ExecutorKind, Resources};

use crate::command::{CommandExecutor, CommandOptions};
use crate::error::ExecError;
use crate::hooks::{PreExecHook, RlimitConfig};
use crate::launcher::{LaunchRequest, LauncherKind, LauncherRef, Redirect, describe_status};
use crate::usage;

pub const FRAMEWORK_ID_ENV: &str = "BERTH_FRAMEWORK_ID";
pub const EXECUTOR_ID_ENV: &str = "BERTH_EXECUTOR_ID";
pub const AGENT_ID_ENV: &str = "BERTH_AGENT_ID";
pub const SANDBOX_ENV: &str = "BERTH_SANDBOX_DIRECTORY";

/// Settings of the process containerizer and its command executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerizerConfig {
    pub launcher: LauncherKind,
    /// Applied to every executor and task process.
    pub rlimits: RlimitConfig,
    /// Kill grace for command tasks without a kill policy.
    pub task_kill_grace_period_ms: u64,
    /// How often the command executor resends unacknowledged updates.
    pub status_update_retry_interval_ms: u64,
}

impl Default for ContainerizerConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherKind::default(),
            rlimits: RlimitConfig::default(),
            task_kill_grace_period_ms: 3_000,
            status_update_retry_interval_ms: 10_000,
        }
    }
}

#[derive(Clone)]
enum Backing {
    /// A custom executor process leading its own boundary.
    Process,
    /// The in-process command executor; its task runs in `boundary`.
    Command {
        cancel: CancellationToken,
        boundary: ContainerId,
    },
}

struct Container {
    resources: Resources,
    backing: Backing,
    exit: watch::Receiver<Option<ContainerTermination>>,
}

/// Containerizer backed by plain processes.
///
/// Custom executors run as the leader of their own boundary. Command tasks
/// get an in-process executor that runs the task in a boundary nested in
/// the container.
pub struct ProcessContainerizer {
    launcher: LauncherRef,
    agent: AgentHandle,
    clock: ClockHandle,
    config: ContainerizerConfig,
    hooks: Vec<PreExecHook>,
    containers: Mutex<HashMap<ContainerId, Container>>,
}

impl ProcessContainerizer {
    pub fn new(launcher: LauncherRef, agent: AgentHandle, config: ContainerizerConfig) -> Self {
        Self {
            launcher,
            agent,
            clock: tokio_clock(),
            config,
            hooks: Vec::new(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: ClockHandle) -> Self {
        self.clock = clock;
        self
    }

    /// Extra `pre_exec` steps for every executor and command task this
    /// containerizer starts.
    pub fn with_hooks(mut self, hooks: Vec<PreExecHook>) -> Self {
        self.hooks = hooks;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContainerId, Container>> {
        self.containers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reports the boundary's end once its leader is gone and the rest of
    /// the group has been killed.
    fn watch_process(&self, container_id: ContainerId) -> watch::Receiver<Option<ContainerTermination>> {
        let (tx, rx) = watch::channel(None);
        let launcher = self.launcher.clone();
        tokio::spawn(async move {
            let status = match launcher.wait(&container_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(container = %container_id, error = %e, "failed to wait for executor");
                    None
                }
            };
            if let Err(e) = launcher.destroy(&container_id).await {
                warn!(container = %container_id, error = %e, "failed to clean up executor boundary");
            }
            let message = match status {
                Some(raw) => format!("Executor {}", describe_status(raw)),
                None => "Executor exit status was not observed".to_string(),
            };
            debug!(container = %container_id, ?status, "executor boundary ended");
            tx.send_replace(Some(ContainerTermination {
                status,
                message: Some(message),
            }));
        });
        rx
    }

    async fn launch_process(&self, container_id: &ContainerId, config: &ContainerConfig) -> Result<(), ExecError> {
        let command = config
            .executor
            .command
            .as_ref()
            .ok_or_else(|| ExecError::InvalidRequest(format!("executor {} has no command", config.executor.executor_id)))?;

        let mut request = LaunchRequest::from_command(command);
        request.env = self.environment(config).merged(&command.env);
        if request.cwd.is_none() {
            request.cwd = Some(config.sandbox.clone());
        }
        request.stdout = Redirect::File(config.sandbox.join("stdout"));
        request.stderr = Redirect::File(config.sandbox.join("stderr"));
        request.rlimits = self.config.rlimits.clone();
        request.hooks = self.hooks.clone();

        self.launcher.launch(container_id, request).await?;
        let exit = self.watch_process(container_id.clone());
        self.lock().insert(
            container_id.clone(),
            Container {
                resources: config.resources.clone(),
                backing: Backing::Process,
                exit,
            },
        );
        Ok(())
    }

    fn launch_command(&self, container_id: &ContainerId, config: &ContainerConfig) {
        let cancel = CancellationToken::new();
        let boundary = container_id.child(config.executor.executor_id.as_str());
        let executor = CommandExecutor {
            agent: self.agent.clone(),
            launcher: self.launcher.clone(),
            framework_id: config.framework.id.clone(),
            executor_id: config.executor.executor_id.clone(),
            boundary: boundary.clone(),
            sandbox: config.sandbox.clone(),
            env: self.environment(config),
            rlimits: self.config.rlimits.clone(),
            hooks: self.hooks.clone(),
            options: CommandOptions {
                kill_grace: Duration::from_millis(self.config.task_kill_grace_period_ms),
                retry_interval: Duration::from_millis(self.config.status_update_retry_interval_ms),
            },
            clock: self.clock.clone(),
        };

        let (tx, exit) = watch::channel(None);
        let token = cancel.clone();
        tokio::spawn(async move {
            let termination = executor.run(token).await;
            tx.send_replace(Some(termination));
        });
        self.lock().insert(
            container_id.clone(),
            Container {
                resources: config.resources.clone(),
                backing: Backing::Command { cancel, boundary },
                exit,
            },
        );
    }

    fn environment(&self, config: &ContainerConfig) -> berth_model::Env {
        let mut env = config.env.clone();
        env.push(FRAMEWORK_ID_ENV, config.framework.id.as_str());
        env.push(EXECUTOR_ID_ENV, config.executor.executor_id.as_str());
        if let Some(agent_id) = &config.agent_id {
            env.push(AGENT_ID_ENV, agent_id.as_str());
        }
        env.push(SANDBOX_ENV, config.sandbox.to_string_lossy());
        env
    }

    /// Boundary whose processes are accounted to the container.
    fn accounted(&self, container_id: &ContainerId) -> Result<(Resources, ContainerId), ExecError> {
        let containers = self.lock();
        let container = containers
            .get(container_id)
            .ok_or_else(|| ExecError::UnknownContainer(container_id.clone()))?;
        let boundary = match &container.backing {
            Backing::Process => container_id.clone(),
            Backing::Command { boundary, .. } => boundary.clone(),
        };
        Ok((container.resources.clone(), boundary))
    }
}

#[async_trait]
impl Containerizer for ProcessContainerizer {
    async fn recover(&self, known: &[ContainerId]) -> Result<Vec<ContainerId>, CoreError> {
        let orphans = self.launcher.recover(known).await?;
        for container_id in known {
            let tracked = self.lock().contains_key(container_id);
            if tracked || self.launcher.status(container_id).await.is_err() {
                continue;
            }
            info!(container = %container_id, "recovered executor boundary");
            let exit = self.watch_process(container_id.clone());
            self.lock().insert(
                container_id.clone(),
                Container {
                    resources: Resources::default(),
                    backing: Backing::Process,
                    exit,
                },
            );
        }
        Ok(orphans)
    }

    #[instrument(skip_all, fields(container = %container_id, executor = %config.executor.executor_id))]
    async fn launch(&self, container_id: &ContainerId, config: ContainerConfig) -> Result<(), CoreError> {
        if self.lock().contains_key(container_id) {
            return Err(ExecError::AlreadyExists(container_id.clone()).into());
        }
        tokio::fs::create_dir_all(&config.sandbox)
            .await
            .map_err(ExecError::from)?;

        match config.executor.kind {
            ExecutorKind::Command => self.launch_command(container_id, &config),
            ExecutorKind::Custom => self.launch_process(container_id, &config).await?,
        }
        info!(sandbox = %config.sandbox.display(), "container launched");
        Ok(())
    }

    async fn update(&self, container_id: &ContainerId, resources: &Resources) -> Result<(), CoreError> {
        let mut containers = self.lock();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| ExecError::UnknownContainer(container_id.clone()))?;
        debug!(container = %container_id, resources = %resources, "container resources updated");
        container.resources = resources.clone();
        Ok(())
    }

    async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics, CoreError> {
        let (resources, boundary) = self.accounted(container_id)?;
        let mut stats = ResourceStatistics {
            timestamp: self.clock.timestamp(),
            ..ResourceStatistics::default()
        };
        usage::limits(&resources, &mut stats);

        if let Ok(status) = self.launcher.status(&boundary).await {
            let processes = tokio::task::spawn_blocking(usage::scan_proc)
                .await
                .map_err(|e| ExecError::Io(io::Error::other(e)))?
                .map_err(ExecError::from)?;
            usage::accumulate(status.pid, processes, &mut stats);
        }
        Ok(stats)
    }

    async fn status(&self, container_id: &ContainerId) -> Result<ContainerStatus, CoreError> {
        let (_, boundary) = self.accounted(container_id)?;
        let executor_pid = self.launcher.status(&boundary).await.ok().map(|s| s.pid);
        Ok(ContainerStatus {
            container_id: container_id.clone(),
            executor_pid,
        })
    }

    async fn wait(&self, container_id: &ContainerId) -> Result<Option<ContainerTermination>, CoreError> {
        let Some(mut exit) = self.lock().get(container_id).map(|c| c.exit.clone()) else {
            return Ok(None);
        };
        let termination = match exit.wait_for(Option::is_some).await {
            Ok(t) => t.clone(),
            Err(_) => None,
        };
        self.lock().remove(container_id);
        Ok(Some(termination.unwrap_or_default()))
    }

    #[instrument(skip(self))]
    async fn destroy(&self, container_id: &ContainerId) -> Result<bool, CoreError> {
        let found = self
            .lock()
            .get(container_id)
            .map(|c| (c.backing.clone(), c.exit.clone()));
        let Some((backing, mut exit)) = found else {
            // Left over from before a restart; the launcher may still hold it.
            if self.launcher.status(container_id).await.is_ok() {
                self.launcher.destroy(container_id).await?;
                return Ok(true);
            }
            return Ok(false);
        };

        match backing {
            Backing::Command { cancel, .. } => cancel.cancel(),
            Backing::Process => self.launcher.destroy(container_id).await?,
        }
        let _ = exit.wait_for(Option::is_some).await;
        self.lock().remove(container_id);
        info!("container destroyed");
        Ok(true)
    }

    async fn containers(&self) -> Result<Vec<ContainerId>, CoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
