use tokio::sync::{mpsc, oneshot};

use berth_model::message::{ControllerMessage, Envelope, ExecutorMessage};
use berth_model::{
    ContainerId, Endpoint, ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, ProviderState, ResourceVersionEntry,
    StatusUpdate, TaskId, TaskInfo,
};

use super::snapshot::AgentSnapshot;
use crate::collab::{ContainerTermination, ExecutorLinkRef};
use crate::error::CoreError;

/// A launch request after it has been routed to an executor.
#[derive(Debug, Clone)]
pub(crate) struct PreparedLaunch {
    pub(crate) framework: FrameworkInfo,
    pub(crate) executor: ExecutorInfo,
    pub(crate) tasks: Vec<TaskInfo>,
    pub(crate) group: bool,
    pub(crate) resource_versions: Vec<ResourceVersionEntry>,
}

/// Why a container's resource grant was changed.
#[derive(Debug, Clone)]
pub(crate) enum UpdatePurpose {
    /// Grow the grant before forwarding queued units.
    Flush { units: Vec<super::state::LaunchUnit> },
    /// Shrink the grant after a task turned terminal.
    Release { task_id: TaskId },
}

/// Everything the agent actor reacts to.
pub(crate) enum AgentEvent {
    Controller(Envelope<ControllerMessage>),
    Executor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        message: ExecutorMessage,
        link: Option<ExecutorLinkRef>,
    },
    ProviderUpdated(ProviderState),
    Snapshot(oneshot::Sender<AgentSnapshot>),
    Shutdown,

    Detected {
        leader: Option<Endpoint>,
    },
    RegistrationTimer {
        epoch: u64,
    },
    PingTimeout,
    ExecutorRegistrationTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
    ExecutorShutdownTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
    ReregistrationTimeout,

    SecretGenerated {
        launch: PreparedLaunch,
        result: Result<Vec<u8>, String>,
    },
    ContainerLaunched {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        result: Result<(), String>,
    },
    ContainerUpdated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        purpose: UpdatePurpose,
        result: Result<(), String>,
    },
    ContainerExited {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        termination: Option<ContainerTermination>,
    },
    ForwardUpdate(StatusUpdate),
}

/// Cloneable entry point into a running agent.
#[derive(Clone, Debug)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

/// Receiving side of the agent's mailbox, consumed by [`AgentBuilder::build`].
///
/// [`AgentBuilder::build`]: super::AgentBuilder::build
pub struct AgentMailbox {
    pub(crate) tx: mpsc::UnboundedSender<AgentEvent>,
    pub(crate) rx: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Creates the agent's mailbox ahead of the agent, so collaborators that
/// call back into it (an in-process executor, a transport) can be built first.
pub fn mailbox() -> (AgentHandle, AgentMailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AgentHandle { tx: tx.clone() }, AgentMailbox { tx, rx })
}

impl AgentHandle {
    pub fn controller_message(&self, from: Endpoint, message: ControllerMessage) -> Result<(), CoreError> {
        self.send(AgentEvent::Controller(Envelope::new(from, message)))
    }

    /// Delivers a message from an executor. `link` is the channel back to it
    /// and is required for registration.
    pub fn executor_message(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        message: ExecutorMessage,
        link: Option<ExecutorLinkRef>,
    ) -> Result<(), CoreError> {
        self.send(AgentEvent::Executor {
            framework_id,
            executor_id,
            message,
            link,
        })
    }

    pub fn update_resource_provider(&self, state: ProviderState) -> Result<(), CoreError> {
        self.send(AgentEvent::ProviderUpdated(state))
    }

    pub async fn snapshot(&self) -> Result<AgentSnapshot, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentEvent::Snapshot(reply))?;
        rx.await.map_err(|_| CoreError::AgentGone)
    }

    /// Stops the agent loop. Executors are left running for recovery.
    pub fn shutdown(&self) -> Result<(), CoreError> {
        self.send(AgentEvent::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: AgentEvent) -> Result<(), CoreError> {
        self.tx.send(event).map_err(|_| CoreError::AgentGone)
    }
}
