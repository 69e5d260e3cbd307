use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::actor::{AgentActor, Io};
use super::handle::{AgentEvent, AgentMailbox};
use super::health::HealthMonitor;
use crate::clock::{ClockHandle, tokio_clock};
use crate::collab::{Containerizer, ControllerDetector, ControllerLinkRef, RecoveredState, SecretGenerator, StateStore};
use crate::config::AgentConfig;
use crate::error::CoreError;
use crate::metrics::{MetricsHandle, noop_metrics};
use crate::status_update::{ForwardFn, StatusUpdateManager};

/// Wires an [`Agent`] to its collaborators.
pub struct AgentBuilder {
    config: AgentConfig,
    containerizer: Arc<dyn Containerizer>,
    controller: ControllerLinkRef,
    detector: Arc<dyn ControllerDetector>,
    clock: ClockHandle,
    metrics: MetricsHandle,
    secrets: Option<Arc<dyn SecretGenerator>>,
    store: Option<Arc<dyn StateStore>>,
    recovered: Option<RecoveredState>,
}

impl AgentBuilder {
    pub fn new(
        config: AgentConfig,
        containerizer: Arc<dyn Containerizer>,
        controller: ControllerLinkRef,
        detector: Arc<dyn ControllerDetector>,
    ) -> Self {
        Self {
            config,
            containerizer,
            controller,
            detector,
            clock: tokio_clock(),
            metrics: noop_metrics(),
            secrets: None,
            store: None,
            recovered: None,
        }
    }

    pub fn with_clock(mut self, clock: ClockHandle) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Executors get a freshly generated authentication token in their
    /// environment when a generator is set.
    pub fn with_secret_generator(mut self, secrets: Arc<dyn SecretGenerator>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Checkpoints of frameworks with `checkpoint` set go here, and the
    /// agent recovers from it on start.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Recovers from `state` instead of loading the store.
    pub fn with_recovered_state(mut self, state: RecoveredState) -> Self {
        self.recovered = Some(state);
        self
    }

    pub fn build(self, mailbox: AgentMailbox) -> Result<Agent, CoreError> {
        self.config.validate()?;
        Ok(Agent {
            inner: self,
            mailbox,
        })
    }
}

/// A configured agent, ready to run.
pub struct Agent {
    inner: AgentBuilder,
    mailbox: AgentMailbox,
}

impl Agent {
    /// Recovers, then serves the mailbox until shutdown or cancellation.
    ///
    /// Executors are left alone when the agent stops, so a restarted agent
    /// can recover them.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoreError> {
        let Agent { inner, mailbox } = self;
        let AgentMailbox { tx, rx } = mailbox;
        let cancel = cancel.child_token();

        let forward_tx = tx.clone();
        let forward: ForwardFn = Arc::new(move |update| {
            let _ = forward_tx.send(AgentEvent::ForwardUpdate(update));
        });
        let sum = StatusUpdateManager::spawn(
            inner.config.status_update_retry.clone(),
            inner.clock.clone(),
            inner.metrics.clone(),
            inner.store.clone(),
            forward,
            cancel.clone(),
        );
        let health = HealthMonitor::spawn(inner.clock.clone(), tx.clone(), cancel.clone());

        let recovered = match (inner.recovered, &inner.store) {
            (Some(state), _) => Some(state),
            (None, Some(store)) => Some(store.load().await?),
            (None, None) => None,
        };

        let resources = inner.config.parsed_resources()?;
        let io = Io {
            containerizer: inner.containerizer,
            controller: inner.controller,
            secrets: inner.secrets,
            clock: inner.clock,
            tx,
        };
        let mut actor = AgentActor::new(
            inner.config,
            resources,
            io,
            inner.metrics,
            inner.store,
            inner.detector,
            sum,
            health,
            cancel.clone(),
        );

        info!("agent starting");
        let result = match actor.start(recovered).await {
            Ok(()) => {
                actor.run(rx).await;
                Ok(())
            }
            Err(e) => Err(e),
        };
        cancel.cancel();
        info!("agent stopped");
        result
    }
}
