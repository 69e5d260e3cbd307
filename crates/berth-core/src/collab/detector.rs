use async_trait::async_trait;
use tokio::sync::watch;

use berth_model::Endpoint;

use crate::error::CoreError;

/// Source of truth for which controller currently leads.
#[async_trait]
pub trait ControllerDetector: Send + Sync + 'static {
    /// Resolves once the leader differs from `previous`. `None` means no
    /// controller is currently elected.
    async fn detect(&self, previous: Option<Endpoint>) -> Result<Option<Endpoint>, CoreError>;
}

/// Detector whose leader is appointed explicitly.
#[derive(Debug)]
pub struct StandaloneDetector {
    leader: watch::Sender<Option<Endpoint>>,
}

impl StandaloneDetector {
    pub fn new(initial: Option<Endpoint>) -> Self {
        let (leader, _) = watch::channel(initial);
        Self { leader }
    }

    pub fn appoint(&self, leader: Option<Endpoint>) {
        self.leader.send_replace(leader);
    }

    pub fn leader(&self) -> Option<Endpoint> {
        self.leader.borrow().clone()
    }
}

impl Default for StandaloneDetector {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ControllerDetector for StandaloneDetector {
    async fn detect(&self, previous: Option<Endpoint>) -> Result<Option<Endpoint>, CoreError> {
        let mut rx = self.leader.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if current != previous {
                return Ok(current);
            }
            rx.changed()
                .await
                .map_err(|_| CoreError::Detector("leader channel closed".into()))?;
        }
    }
}
