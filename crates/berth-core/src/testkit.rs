//! In-memory collaborators for exercising the agent without processes.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use berth_model::{ContainerId, Resources};

use crate::collab::{
    ContainerConfig, ContainerStatus, ContainerTermination, Containerizer, Principal, ResourceStatistics, Secret,
    SecretGenerator,
};
use crate::error::CoreError;

struct MockContainer {
    config: Option<ContainerConfig>,
    exit: watch::Sender<Option<ContainerTermination>>,
}

impl MockContainer {
    fn new(config: Option<ContainerConfig>) -> Self {
        let (exit, _) = watch::channel(None);
        Self { config, exit }
    }

    fn is_live(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

#[derive(Default)]
struct MockState {
    containers: HashMap<ContainerId, MockContainer>,
    launch_order: Vec<ContainerId>,
    updates: Vec<(ContainerId, Resources)>,
    destroyed: Vec<ContainerId>,
    fail_launch: Option<String>,
    fail_update: Option<String>,
    launch_delay: Option<Duration>,
}

/// Containerizer whose boundaries exist only in memory.
///
/// A boundary lives until [`MockContainerizer::exit`] or `destroy` ends it.
#[derive(Default)]
pub struct MockContainerizer {
    state: Mutex<MockState>,
}

impl MockContainerizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_launches(&self, message: impl Into<String>) {
        self.lock().fail_launch = Some(message.into());
    }

    pub fn fail_updates(&self, message: impl Into<String>) {
        self.lock().fail_update = Some(message.into());
    }

    /// Holds every later `launch` for `delay` before it completes.
    pub fn delay_launches(&self, delay: Duration) {
        self.lock().launch_delay = Some(delay);
    }

    /// Registers a live boundary, as if it survived a restart.
    pub fn adopt(&self, container_id: ContainerId) {
        self.lock()
            .containers
            .insert(container_id, MockContainer::new(None));
    }

    /// Ends a boundary as if its executor exited with `status`.
    pub fn exit(&self, container_id: &ContainerId, status: i32) -> bool {
        self.finish(
            container_id,
            ContainerTermination {
                status: Some(status),
                message: None,
            },
        )
    }

    fn finish(&self, container_id: &ContainerId, termination: ContainerTermination) -> bool {
        let state = self.lock();
        match state.containers.get(container_id) {
            Some(c) if c.is_live() => {
                c.exit.send_replace(Some(termination));
                true
            }
            _ => false,
        }
    }

    /// Configs of every launch, oldest first.
    pub fn launched(&self) -> Vec<(ContainerId, ContainerConfig)> {
        let state = self.lock();
        state
            .launch_order
            .iter()
            .filter_map(|id| {
                let config = state.containers.get(id)?.config.clone()?;
                Some((id.clone(), config))
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(ContainerId, Resources)> {
        self.lock().updates.clone()
    }

    pub fn destroyed(&self) -> Vec<ContainerId> {
        self.lock().destroyed.clone()
    }

    pub fn is_live(&self, container_id: &ContainerId) -> bool {
        self.lock()
            .containers
            .get(container_id)
            .is_some_and(MockContainer::is_live)
    }
}

#[async_trait]
impl Containerizer for MockContainerizer {
    async fn recover(&self, known: &[ContainerId]) -> Result<Vec<ContainerId>, CoreError> {
        let state = self.lock();
        let mut orphans: Vec<ContainerId> = state
            .containers
            .iter()
            .filter(|(id, c)| c.is_live() && !known.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        orphans.sort_by(|a, b| a.value().cmp(b.value()));
        Ok(orphans)
    }

    async fn launch(&self, container_id: &ContainerId, config: ContainerConfig) -> Result<(), CoreError> {
        let delay = self.lock().launch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(message) = &state.fail_launch {
            return Err(CoreError::Containerizer(message.clone()));
        }
        if state.containers.contains_key(container_id) {
            return Err(CoreError::Containerizer(format!("container {container_id} already exists")));
        }
        state
            .containers
            .insert(container_id.clone(), MockContainer::new(Some(config)));
        state.launch_order.push(container_id.clone());
        Ok(())
    }

    async fn update(&self, container_id: &ContainerId, resources: &Resources) -> Result<(), CoreError> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_update {
            return Err(CoreError::Containerizer(message.clone()));
        }
        if !state.containers.contains_key(container_id) {
            return Err(CoreError::Containerizer(format!("unknown container {container_id}")));
        }
        state.updates.push((container_id.clone(), resources.clone()));
        Ok(())
    }

    async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics, CoreError> {
        let state = self.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| CoreError::Containerizer(format!("unknown container {container_id}")))?;
        let resources = container
            .config
            .as_ref()
            .map(|c| c.resources.clone())
            .unwrap_or_default();
        Ok(ResourceStatistics {
            cpus_limit: Some(resources.get("cpus")),
            mem_limit_bytes: Some((resources.get("mem") * 1024.0 * 1024.0) as u64),
            processes: Some(1),
            ..Default::default()
        })
    }

    async fn status(&self, container_id: &ContainerId) -> Result<ContainerStatus, CoreError> {
        if !self.lock().containers.contains_key(container_id) {
            return Err(CoreError::Containerizer(format!("unknown container {container_id}")));
        }
        Ok(ContainerStatus {
            container_id: container_id.clone(),
            executor_pid: None,
        })
    }

    async fn wait(&self, container_id: &ContainerId) -> Result<Option<ContainerTermination>, CoreError> {
        let mut rx = {
            let state = self.lock();
            match state.containers.get(container_id) {
                Some(c) => c.exit.subscribe(),
                None => return Ok(None),
            }
        };
        let termination = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::Containerizer("container watch closed".into()))?;
        Ok(termination.clone())
    }

    async fn destroy(&self, container_id: &ContainerId) -> Result<bool, CoreError> {
        let known = self.finish(
            container_id,
            ContainerTermination {
                status: Some(9),
                message: Some("Container destroyed".into()),
            },
        );
        if known {
            self.lock().destroyed.push(container_id.clone());
        }
        Ok(known)
    }

    async fn containers(&self) -> Result<Vec<ContainerId>, CoreError> {
        let state = self.lock();
        Ok(state
            .launch_order
            .iter()
            .filter(|id| state.containers.get(*id).is_some_and(MockContainer::is_live))
            .cloned()
            .collect())
    }
}

/// Secret generator returning a fixed outcome.
pub struct StaticSecretGenerator {
    result: Result<Secret, String>,
}

impl StaticSecretGenerator {
    pub fn value(token: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(Secret::Value(token.into())),
        })
    }

    pub fn returning(secret: Secret) -> Arc<Self> {
        Arc::new(Self { result: Ok(secret) })
    }

    pub fn failing(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.into()),
        })
    }
}

#[async_trait]
impl SecretGenerator for StaticSecretGenerator {
    async fn generate(&self, _principal: &Principal) -> Result<Secret, CoreError> {
        self.result.clone().map_err(CoreError::Secret)
    }
}
