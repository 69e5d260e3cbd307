use tracing::{info, warn};

use berth_model::{ContainerId, ExecutorId, FrameworkId, Reason};

use super::actor::AgentActor;
use super::handle::AgentEvent;
use super::state::{AgentState, Executor, ExecutorState, Framework, PendingTermination, Task};
use crate::collab::RecoveredState;
use crate::error::CoreError;
use crate::status_update::RecoveredStream;

impl AgentActor {
    /// Rebuilds checkpointed state, if any, before the agent talks to a
    /// controller.
    pub(crate) async fn start(&mut self, recovered: Option<RecoveredState>) -> Result<(), CoreError> {
        match recovered {
            Some(state) => self.recover(state).await,
            None => {
                self.finish_recovery();
                Ok(())
            }
        }
    }

    async fn recover(&mut self, state: RecoveredState) -> Result<(), CoreError> {
        self.agent_id = state.agent_id;

        let mut streams = Vec::new();
        let mut runs: Vec<(FrameworkId, ExecutorId, ContainerId)> = Vec::new();
        for rf in state.frameworks {
            let framework_id = rf.info.id.clone();
            let mut fw = Framework::new(rf.info);

            for re in rf.executors {
                let executor_id = re.info.executor_id.clone();
                let mut exec = Executor::new(re.info, framework_id.clone(), re.container_id.clone());
                exec.recovered = true;

                for rt in re.tasks {
                    streams.push(RecoveredStream {
                        framework_id: framework_id.clone(),
                        executor_id: Some(executor_id.clone()),
                        task_id: rt.info.task_id.clone(),
                        updates: rt.updates.clone(),
                        acknowledged: rt.acknowledged.clone(),
                    });
                    if rt.is_complete() {
                        continue;
                    }

                    let mut task = Task::new(rt.info.clone());
                    task.forwarded = true;
                    task.state = rt.latest_state();
                    task.unacknowledged = rt.pending().iter().map(|u| (u.state(), u.uuid)).collect();
                    task.acknowledged = rt.last_acknowledged().map(|u| (u.state(), u.uuid));
                    if task.state.is_terminal() {
                        exec.terminated.insert(task.id().clone(), task);
                    } else {
                        exec.tasks.insert(task.id().clone(), task);
                    }
                }
                runs.push((framework_id.clone(), executor_id.clone(), re.container_id));
                fw.executors.insert(executor_id, exec);
            }
            self.frameworks.insert(framework_id, fw);
        }

        self.sum.recover(streams).await?;

        let known: Vec<ContainerId> = runs.iter().map(|(_, _, c)| c.clone()).collect();
        for orphan in self.io.containerizer.recover(&known).await? {
            warn!(container = %orphan, "destroying container unknown to any checkpoint");
            self.io.destroy(orphan);
        }
        info!(
            agent = ?self.agent_id,
            frameworks = self.frameworks.len(),
            executors = runs.len(),
            "recovered checkpointed state"
        );

        if runs.is_empty() {
            self.finish_recovery();
            return Ok(());
        }
        for (framework_id, executor_id, container_id) in runs {
            self.io.wait(framework_id, executor_id, container_id);
        }
        self.reregistration_timer = Some(self.io.after(
            self.config.executor_reregistration_timeout(),
            AgentEvent::ReregistrationTimeout,
        ));
        Ok(())
    }

    pub(crate) fn all_reregistered(&self) -> bool {
        self.frameworks
            .values()
            .flat_map(|f| f.executors.values())
            .filter(|e| e.recovered && e.state == ExecutorState::Registering)
            .all(|e| e.reregistered)
    }

    /// Ends the re-registration window: recovered executors that stayed
    /// silent are destroyed and their tasks reported lost.
    pub(crate) fn on_reregistration_timeout(&mut self) {
        self.reregistration_timer = None;
        if self.state != AgentState::Recovering {
            return;
        }
        let timeout = self.config.executor_reregistration_timeout();
        for fw in self.frameworks.values_mut() {
            let collateral = fw.collateral_state();
            for exec in fw.executors.values_mut() {
                if !exec.recovered || exec.reregistered || exec.state != ExecutorState::Registering {
                    continue;
                }
                warn!(framework = %exec.framework_id, executor = %exec.id(), "recovered executor did not re-register");
                exec.pending_termination = Some(PendingTermination {
                    state: collateral,
                    reason: Reason::ExecutorReregistrationTimeout,
                    message: format!("Executor did not re-register within {timeout:?}"),
                });
                exec.state = ExecutorState::Terminating;
                self.io.destroy(exec.container_id.clone());
            }
        }
        self.finish_recovery();
    }

    fn finish_recovery(&mut self) {
        self.state = AgentState::Disconnected;
        info!("recovery complete");
        self.start_detection();
    }
}
