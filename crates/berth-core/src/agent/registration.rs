use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_model::message::{AgentMessage, ExecutorReport, TaskReport};
use berth_model::{AgentId, DurationMs, Endpoint, FrameworkInfo, TaskState};

use super::actor::AgentActor;
use super::handle::AgentEvent;
use super::state::{AgentState, ExecutorState};
use crate::clock::ClockHandle;
use crate::collab::ControllerDetector;
use crate::metrics::RegistrationKind;

/// Delay before retrying a failed detection.
const DETECTION_RETRY: Duration = Duration::from_secs(1);

impl AgentActor {
    /// Starts following leader changes. Runs once, after recovery.
    pub(crate) fn start_detection(&mut self) {
        if self.detecting {
            return;
        }
        self.detecting = true;
        tokio::spawn(detect_leader(
            self.detector.clone(),
            self.io.tx.clone(),
            self.io.clock.clone(),
            self.redetect.clone(),
            self.cancel.clone(),
        ));
    }

    pub(crate) fn on_detected(&mut self, leader: Option<Endpoint>) {
        self.disconnect();
        self.leader = leader;

        let Some(leader) = self.leader.clone() else {
            info!("no leading controller detected");
            return;
        };
        info!(leader = %leader, "detected leading controller");

        let factor = self.config.registration_backoff_factor();
        let delay = factor.mul_f64(rand::random::<f64>());
        self.registration_backoff = factor * 2;
        self.registration_timer = Some(
            self.io
                .after(delay, AgentEvent::RegistrationTimer { epoch: self.epoch }),
        );
    }

    /// Sends one registration attempt and schedules the next one.
    pub(crate) fn on_registration_timer(&mut self, epoch: u64) {
        if epoch != self.epoch || self.state != AgentState::Disconnected {
            return;
        }
        let Some(leader) = self.leader.clone() else {
            return;
        };

        let message = match self.agent_id.clone() {
            None => {
                self.metrics.record_registration_attempt(RegistrationKind::Register);
                AgentMessage::Register {
                    resources: self.resources.clone(),
                    resource_versions: self.versions.entries(),
                }
            }
            Some(agent_id) => {
                self.metrics.record_registration_attempt(RegistrationKind::Reregister);
                self.reregister_message(agent_id)
            }
        };
        info!(leader = %leader, kind = message.kind(), "registering with controller");
        self.io.send(Some(&leader), message);

        let max = self.registration_backoff.min(self.config.registration_retry_max());
        let delay = max.mul_f64(rand::random::<f64>());
        self.registration_backoff = max * 2;
        self.registration_timer = Some(self.io.after(delay, AgentEvent::RegistrationTimer { epoch }));
    }

    /// Everything the controller needs to rebuild its view of this node.
    fn reregister_message(&self, agent_id: AgentId) -> AgentMessage {
        let mut frameworks: Vec<&FrameworkInfo> = self.frameworks.values().map(|f| &f.info).collect();
        frameworks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut executors = Vec::new();
        let mut tasks = Vec::new();
        for fw in self.frameworks.values() {
            for exec in fw.executors.values() {
                if exec.state != ExecutorState::Terminated {
                    executors.push(ExecutorReport {
                        framework_id: fw.info.id.clone(),
                        executor: exec.info.clone(),
                    });
                }
                for task in exec.tasks.values().chain(exec.terminated.values()) {
                    let marker = task.status_update_marker();
                    tasks.push(TaskReport {
                        framework_id: fw.info.id.clone(),
                        executor_id: Some(exec.id().clone()),
                        task_id: task.id().clone(),
                        state: task.state,
                        resources: task.info.resources.clone(),
                        status_update_state: marker.map(|(s, _)| s),
                        status_update_uuid: marker.map(|(_, u)| u),
                    });
                }
            }
            for pending in fw.pending.values() {
                tasks.push(TaskReport {
                    framework_id: fw.info.id.clone(),
                    executor_id: Some(pending.executor_id.clone()),
                    task_id: pending.info.task_id.clone(),
                    state: TaskState::Staging,
                    resources: pending.info.resources.clone(),
                    status_update_state: None,
                    status_update_uuid: None,
                });
            }
            for task in fw.unrouted.values() {
                let marker = task.status_update_marker();
                tasks.push(TaskReport {
                    framework_id: fw.info.id.clone(),
                    executor_id: None,
                    task_id: task.id().clone(),
                    state: task.state,
                    resources: task.info.resources.clone(),
                    status_update_state: marker.map(|(s, _)| s),
                    status_update_uuid: marker.map(|(_, u)| u),
                });
            }
        }
        executors.sort_by(|a, b| a.executor.executor_id.cmp(&b.executor.executor_id));
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        AgentMessage::Reregister {
            agent_id,
            resources: self.resources.clone(),
            resource_versions: self.versions.entries(),
            frameworks: frameworks.into_iter().cloned().collect(),
            executors,
            tasks,
        }
    }

    pub(crate) async fn on_registered(&mut self, agent_id: AgentId, ping_timeout_ms: Option<DurationMs>, reregistered: bool) {
        match self.state {
            AgentState::Disconnected => {}
            AgentState::Running => {
                if self.agent_id.as_ref() == Some(&agent_id) {
                    debug!(agent = %agent_id, "already registered");
                } else {
                    warn!(agent = %agent_id, current = ?self.agent_id, "registration for another id while registered; ignoring");
                }
                return;
            }
            state => {
                warn!(agent = %agent_id, state = ?state, "ignoring registration");
                return;
            }
        }
        if let Some(current) = &self.agent_id {
            if current != &agent_id {
                warn!(agent = %agent_id, current = %current, "controller handed out a different agent id; ignoring");
                return;
            }
        }

        if self.agent_id.is_none() {
            if let Some(store) = &self.store {
                if let Err(e) = store.checkpoint_agent(&agent_id).await {
                    warn!(agent = %agent_id, error = %e, "failed to checkpoint agent id");
                }
            }
        }
        self.agent_id = Some(agent_id.clone());
        self.state = AgentState::Running;
        self.registration_timer = None;

        let window = match ping_timeout_ms {
            Some(ms) => Duration::from_millis(ms) * self.config.max_ping_timeouts,
            None => self.config.ping_window(),
        };
        self.health.arm(window);
        self.sum.resume();

        if reregistered {
            info!(agent = %agent_id, "re-registered with controller");
        } else {
            info!(agent = %agent_id, "registered with controller");
        }
        self.send_update_agent();
    }

    pub(crate) fn on_ping(&mut self, from: Endpoint, connected: bool) {
        self.health.ping();
        self.io.send(Some(&from), AgentMessage::Pong);

        if !connected && self.state == AgentState::Running {
            warn!(from = %from, "controller considers this agent disconnected; re-registering");
            self.redetect();
        }
    }

    pub(crate) fn on_ping_timeout(&mut self) {
        if self.state != AgentState::Running {
            return;
        }
        self.metrics.record_ping_timeout();
        warn!(leader = ?self.leader, "controller went silent; re-detecting");
        self.redetect();
    }

    /// Publishes the current resource versions and provider states.
    pub(crate) fn send_update_agent(&self) {
        if self.state != AgentState::Running {
            return;
        }
        let Some(agent_id) = self.agent_id.clone() else {
            return;
        };
        self.io.send(
            self.leader.as_ref(),
            AgentMessage::UpdateAgent {
                agent_id,
                resource_versions: self.versions.entries(),
                providers: self.versions.providers(),
            },
        );
    }

    /// Gives up on the current registration and asks the detector for the
    /// leader again.
    fn redetect(&mut self) {
        self.disconnect();
        self.redetect.notify_one();
    }

    fn disconnect(&mut self) {
        if self.state != AgentState::Terminating {
            self.state = AgentState::Disconnected;
        }
        self.sum.pause();
        self.health.disarm();
        self.registration_timer = None;
        self.epoch += 1;
    }
}

async fn detect_leader(
    detector: Arc<dyn ControllerDetector>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    clock: ClockHandle,
    redetect: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut previous: Option<Endpoint> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = redetect.notified() => previous = None,
            detected = detector.detect(previous.clone()) => match detected {
                Ok(leader) => {
                    previous = leader.clone();
                    if tx.send(AgentEvent::Detected { leader }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "controller detection failed");
                    clock.sleep(DETECTION_RETRY).await;
                }
            },
        }
    }
    debug!("controller detection stopped");
}
