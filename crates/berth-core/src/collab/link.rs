use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use berth_model::message::{AgentMessage, ExecutorCommand};
use berth_model::Endpoint;

use crate::error::CoreError;

/// Outbound path to controllers.
///
/// Delivery is best effort: lost messages are recovered by the retry and
/// re-registration protocols, never by the link.
pub trait ControllerLink: Send + Sync + 'static {
    fn send(&self, to: &Endpoint, message: AgentMessage);
}

pub type ControllerLinkRef = Arc<dyn ControllerLink>;

/// Outbound path to one connected executor.
pub trait ExecutorLink: Send + Sync + 'static {
    /// Fails once the executor end has gone away.
    fn send(&self, command: ExecutorCommand) -> Result<(), CoreError>;
}

pub type ExecutorLinkRef = Arc<dyn ExecutorLink>;

/// Controller link that hands messages to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelControllerLink {
    tx: mpsc::UnboundedSender<(Endpoint, AgentMessage)>,
}

impl ChannelControllerLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Endpoint, AgentMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ControllerLink for ChannelControllerLink {
    fn send(&self, to: &Endpoint, message: AgentMessage) {
        let _ = self.tx.send((to.clone(), message));
    }
}

/// Controller link for a daemon running without a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingControllerLink;

impl ControllerLink for LoggingControllerLink {
    fn send(&self, to: &Endpoint, message: AgentMessage) {
        debug!(to = %to, kind = message.kind(), "no controller transport; dropping message");
    }
}

/// Executor link backed by an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelExecutorLink {
    tx: mpsc::UnboundedSender<ExecutorCommand>,
}

impl ChannelExecutorLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ExecutorLink for ChannelExecutorLink {
    fn send(&self, command: ExecutorCommand) -> Result<(), CoreError> {
        self.tx
            .send(command)
            .map_err(|_| CoreError::Link("executor channel closed".into()))
    }
}
