use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use berth_model::message::{AgentMessage, ControllerMessage, Envelope};
use berth_model::{
    AgentId, ContainerId, Endpoint, ExecutorId, FrameworkId, Reason, Resources, Source, TaskId, TaskState, TaskStatus,
};

use super::handle::{AgentEvent, PreparedLaunch, UpdatePurpose};
use super::health::HealthMonitor;
use super::snapshot::{AgentSnapshot, ExecutorSnapshot, FrameworkSnapshot};
use super::state::{AgentState, Framework};
use crate::clock::ClockHandle;
use crate::collab::{
    ContainerConfig, Containerizer, ControllerDetector, ControllerLinkRef, Principal, SecretGenerator, StateStore,
    secret_value,
};
use crate::config::AgentConfig;
use crate::metrics::MetricsHandle;
use crate::status_update::StatusUpdateManager;
use crate::timer::Timer;
use crate::versions::ResourceVersionBook;

/// Side effects the actor starts without waiting on them.
///
/// Kept apart from the actor's records so handlers can hold a mutable
/// borrow of a framework while scheduling work.
pub(crate) struct Io {
    pub(crate) containerizer: Arc<dyn Containerizer>,
    pub(crate) controller: ControllerLinkRef,
    pub(crate) secrets: Option<Arc<dyn SecretGenerator>>,
    pub(crate) clock: ClockHandle,
    pub(crate) tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Io {
    pub(crate) fn after(&self, delay: Duration, event: AgentEvent) -> Timer {
        Timer::schedule(&self.clock, delay, self.tx.clone(), event)
    }

    pub(crate) fn send(&self, to: Option<&Endpoint>, message: AgentMessage) {
        match to {
            Some(to) => {
                trace!(to = %to, kind = message.kind(), "sending to controller");
                self.controller.send(to, message);
            }
            None => debug!(kind = message.kind(), "no leading controller; message dropped"),
        }
    }

    /// A status the agent produces on an executor's behalf.
    pub(crate) fn status(&self, task_id: TaskId, state: TaskState, reason: Reason, message: impl Into<String>) -> TaskStatus {
        TaskStatus::new(task_id, state, Source::Agent)
            .with_reason(reason)
            .with_message(message)
            .at(self.clock.timestamp())
    }

    pub(crate) fn launch(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        config: ContainerConfig,
    ) {
        let containerizer = self.containerizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = containerizer
                .launch(&container_id, config)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AgentEvent::ContainerLaunched {
                framework_id,
                executor_id,
                container_id,
                result,
            });
        });
    }

    pub(crate) fn update(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        resources: Resources,
        purpose: UpdatePurpose,
    ) {
        let containerizer = self.containerizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = containerizer
                .update(&container_id, &resources)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AgentEvent::ContainerUpdated {
                framework_id,
                executor_id,
                container_id,
                purpose,
                result,
            });
        });
    }

    /// Reports the container's end as `ContainerExited`.
    pub(crate) fn wait(&self, framework_id: FrameworkId, executor_id: ExecutorId, container_id: ContainerId) {
        let containerizer = self.containerizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let termination = match containerizer.wait(&container_id).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(container = %container_id, error = %e, "waiting on container failed");
                    None
                }
            };
            let _ = tx.send(AgentEvent::ContainerExited {
                framework_id,
                executor_id,
                container_id,
                termination,
            });
        });
    }

    pub(crate) fn destroy(&self, container_id: ContainerId) {
        let containerizer = self.containerizer.clone();
        tokio::spawn(async move {
            match containerizer.destroy(&container_id).await {
                Ok(true) => debug!(container = %container_id, "container destroyed"),
                Ok(false) => debug!(container = %container_id, "container already gone"),
                Err(e) => warn!(container = %container_id, error = %e, "failed to destroy container"),
            }
        });
    }

    /// Destroys a container nobody is waiting on and reports its end.
    pub(crate) fn destroy_and_report(&self, framework_id: FrameworkId, executor_id: ExecutorId, container_id: ContainerId) {
        let containerizer = self.containerizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = containerizer.destroy(&container_id).await {
                warn!(container = %container_id, error = %e, "failed to destroy container");
            }
            let _ = tx.send(AgentEvent::ContainerExited {
                framework_id,
                executor_id,
                container_id,
                termination: None,
            });
        });
    }

    pub(crate) fn generate_secret(&self, launch: PreparedLaunch) {
        let Some(secrets) = self.secrets.clone() else {
            return;
        };
        let principal = Principal {
            value: launch.executor.executor_id.to_string(),
            claims: [
                ("fid".to_string(), launch.framework.id.to_string()),
                ("eid".to_string(), launch.executor.executor_id.to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match secrets.generate(&principal).await {
                Ok(secret) => secret_value(secret),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(AgentEvent::SecretGenerated { launch, result });
        });
    }
}

pub(crate) struct AgentActor {
    pub(crate) config: AgentConfig,
    pub(crate) resources: Resources,
    pub(crate) io: Io,
    pub(crate) metrics: MetricsHandle,
    pub(crate) store: Option<Arc<dyn StateStore>>,
    pub(crate) detector: Arc<dyn ControllerDetector>,
    pub(crate) sum: StatusUpdateManager,
    pub(crate) health: HealthMonitor,
    pub(crate) redetect: Arc<Notify>,
    pub(crate) cancel: CancellationToken,

    pub(crate) state: AgentState,
    pub(crate) agent_id: Option<AgentId>,
    pub(crate) leader: Option<Endpoint>,
    /// Bumped on every detection; stale registration timers are ignored.
    pub(crate) epoch: u64,
    pub(crate) registration_backoff: Duration,
    pub(crate) registration_timer: Option<Timer>,
    pub(crate) reregistration_timer: Option<Timer>,
    pub(crate) detecting: bool,
    pub(crate) versions: ResourceVersionBook,
    pub(crate) frameworks: HashMap<FrameworkId, Framework>,
    pub(crate) completed_frameworks: VecDeque<FrameworkSnapshot>,
}

impl AgentActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: AgentConfig,
        resources: Resources,
        io: Io,
        metrics: MetricsHandle,
        store: Option<Arc<dyn StateStore>>,
        detector: Arc<dyn ControllerDetector>,
        sum: StatusUpdateManager,
        health: HealthMonitor,
        cancel: CancellationToken,
    ) -> Self {
        let registration_backoff = config.registration_backoff_factor();
        Self {
            config,
            resources,
            io,
            metrics,
            store,
            detector,
            sum,
            health,
            redetect: Arc::new(Notify::new()),
            cancel,
            state: AgentState::Recovering,
            agent_id: None,
            leader: None,
            epoch: 0,
            registration_backoff,
            registration_timer: None,
            reregistration_timer: None,
            detecting: false,
            versions: ResourceVersionBook::new(),
            frameworks: HashMap::new(),
            completed_frameworks: VecDeque::new(),
        }
    }

    pub(crate) async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let AgentEvent::Shutdown = event {
                info!("agent shutdown requested");
                break;
            }
            self.handle(event).await;
        }
        self.state = AgentState::Terminating;
    }

    async fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Controller(envelope) => self.on_controller(envelope).await,
            AgentEvent::Executor {
                framework_id,
                executor_id,
                message,
                link,
            } => self.on_executor(framework_id, executor_id, message, link).await,
            AgentEvent::ProviderUpdated(state) => {
                let provider = state.provider.clone();
                if self.versions.update_provider(state) {
                    info!(provider = %provider, "resource provider updated");
                    self.send_update_agent();
                }
            }
            AgentEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            AgentEvent::Shutdown => {}
            AgentEvent::Detected { leader } => self.on_detected(leader),
            AgentEvent::RegistrationTimer { epoch } => self.on_registration_timer(epoch),
            AgentEvent::PingTimeout => self.on_ping_timeout(),
            AgentEvent::ExecutorRegistrationTimeout {
                framework_id,
                executor_id,
                container_id,
            } => self.on_executor_registration_timeout(&framework_id, &executor_id, &container_id),
            AgentEvent::ExecutorShutdownTimeout {
                framework_id,
                executor_id,
                container_id,
            } => self.on_executor_shutdown_timeout(&framework_id, &executor_id, &container_id),
            AgentEvent::ReregistrationTimeout => self.on_reregistration_timeout(),
            AgentEvent::SecretGenerated { launch, result } => self.on_secret_generated(launch, result).await,
            AgentEvent::ContainerLaunched {
                framework_id,
                executor_id,
                container_id,
                result,
            } => self.on_container_launched(framework_id, executor_id, container_id, result),
            AgentEvent::ContainerUpdated {
                framework_id,
                executor_id,
                container_id,
                purpose,
                result,
            } => {
                self.on_container_updated(framework_id, executor_id, container_id, purpose, result)
                    .await
            }
            AgentEvent::ContainerExited {
                framework_id,
                executor_id,
                container_id,
                termination,
            } => {
                self.on_container_exited(framework_id, executor_id, container_id, termination)
                    .await
            }
            AgentEvent::ForwardUpdate(update) => self.on_forward(update),
        }
    }

    async fn on_controller(&mut self, envelope: Envelope<ControllerMessage>) {
        let Envelope { from, message } = envelope;
        if self.state == AgentState::Recovering {
            debug!(from = %from, kind = message.kind(), "ignoring controller message while recovering");
            return;
        }
        if self.leader.as_ref() != Some(&from) {
            if let ControllerMessage::StatusUpdateAcknowledgement { .. } = message {
                self.metrics.record_invalid_acknowledgement();
            }
            warn!(
                from = %from,
                leader = ?self.leader,
                kind = message.kind(),
                "ignoring message from a controller that is not the leader"
            );
            return;
        }

        match message {
            ControllerMessage::Registered {
                agent_id,
                ping_timeout_ms,
            } => self.on_registered(agent_id, ping_timeout_ms, false).await,
            ControllerMessage::Reregistered {
                agent_id,
                ping_timeout_ms,
            } => self.on_registered(agent_id, ping_timeout_ms, true).await,
            ControllerMessage::Ping { connected } => self.on_ping(from, connected),
            ControllerMessage::RunTask {
                framework,
                task,
                resource_versions,
            } => self.on_run_task(framework, task, resource_versions).await,
            ControllerMessage::RunTaskGroup {
                framework,
                executor,
                tasks,
                resource_versions,
            } => {
                self.on_run_task_group(framework, executor, tasks, resource_versions)
                    .await
            }
            ControllerMessage::KillTask { framework_id, task_id } => self.on_kill_task(framework_id, task_id).await,
            ControllerMessage::StatusUpdateAcknowledgement {
                framework_id,
                task_id,
                uuid,
            } => self.on_acknowledgement(framework_id, task_id, uuid).await,
            ControllerMessage::ShutdownExecutor {
                framework_id,
                executor_id,
            } => {
                info!(framework = %framework_id, executor = %executor_id, "controller asked to shut down executor");
                self.shutdown_executor(&framework_id, &executor_id);
            }
            ControllerMessage::ShutdownFramework { framework_id } => self.on_shutdown_framework(framework_id).await,
            ControllerMessage::UpdateFramework { framework, .. } => self.on_update_framework(framework).await,
        }
    }

    pub(crate) fn snapshot(&self) -> AgentSnapshot {
        let mut frameworks: Vec<FrameworkSnapshot> = self.frameworks.values().map(FrameworkSnapshot::from).collect();
        frameworks.sort_by(|a, b| a.id.cmp(&b.id));
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            state: self.state,
            leader: self.leader.clone(),
            resources: self.resources.clone(),
            resource_versions: self.versions.entries(),
            frameworks,
            completed_frameworks: self.completed_frameworks.iter().cloned().collect(),
        }
    }

    /// Drops an executor once it is gone and its last acknowledgement arrived.
    pub(crate) async fn retire_executor_if_done(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let max = self.config.max_completed_executors_per_framework;
        let Some(fw) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        if !fw.executors.get(executor_id).is_some_and(|e| e.is_done()) {
            return;
        }
        let Some(exec) = fw.executors.remove(executor_id) else {
            return;
        };
        fw.completed_executors.push_back(ExecutorSnapshot::from(&exec));
        while fw.completed_executors.len() > max {
            fw.completed_executors.pop_front();
        }
        let checkpoint = fw.info.checkpoint;
        info!(framework = %framework_id, executor = %executor_id, "executor removed");

        if checkpoint {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove_executor(framework_id, executor_id).await {
                    warn!(executor = %executor_id, error = %e, "failed to remove executor checkpoint");
                }
            }
        }
    }

    /// Drops a framework with nothing left on this node.
    pub(crate) async fn maybe_remove_framework(&mut self, framework_id: &FrameworkId) {
        if !self.frameworks.get(framework_id).is_some_and(|f| f.is_idle()) {
            return;
        }
        let Some(fw) = self.frameworks.remove(framework_id) else {
            return;
        };
        self.sum.cleanup(framework_id.clone());
        self.completed_frameworks.push_back(FrameworkSnapshot::from(&fw));
        while self.completed_frameworks.len() > self.config.max_completed_frameworks {
            self.completed_frameworks.pop_front();
        }
        info!(framework = %framework_id, "framework removed");

        if fw.info.checkpoint {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove_framework(framework_id).await {
                    warn!(framework = %framework_id, error = %e, "failed to remove framework checkpoint");
                }
            }
        }
    }
}
