use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use berth_model::{AgentId, ContainerId, Env, ExecutorInfo, FrameworkInfo, Resources};

use crate::error::CoreError;

/// Everything a containerizer needs to start an executor.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub framework: FrameworkInfo,
    pub executor: ExecutorInfo,
    pub agent_id: Option<AgentId>,
    pub resources: Resources,
    pub env: Env,
    /// Working directory handed to the executor.
    pub sandbox: PathBuf,
    /// Whether the boundary must be recoverable after an agent restart.
    pub checkpoint: bool,
}

/// How a boundary ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTermination {
    /// Raw wait status of the first process, when it was observed.
    pub status: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub executor_pid: Option<u32>,
}

/// Point-in-time usage of one boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatistics {
    pub timestamp: f64,
    pub cpus_limit: Option<f64>,
    pub mem_limit_bytes: Option<u64>,
    pub cpus_user_time_secs: Option<f64>,
    pub cpus_system_time_secs: Option<f64>,
    pub mem_rss_bytes: Option<u64>,
    pub processes: Option<u32>,
}

/// Backend that materialises executors inside isolation boundaries.
#[async_trait]
pub trait Containerizer: Send + Sync + 'static {
    /// Reconciles against boundaries that survived an agent restart and
    /// returns the live ones missing from `known`.
    async fn recover(&self, known: &[ContainerId]) -> Result<Vec<ContainerId>, CoreError> {
        let _ = known;
        Ok(Vec::new())
    }

    async fn launch(&self, container_id: &ContainerId, config: ContainerConfig) -> Result<(), CoreError>;

    /// Adjusts the boundary's resource grant.
    async fn update(&self, container_id: &ContainerId, resources: &Resources) -> Result<(), CoreError>;

    async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics, CoreError>;

    async fn status(&self, container_id: &ContainerId) -> Result<ContainerStatus, CoreError>;

    /// Resolves when the boundary is gone; `None` if it was never known.
    async fn wait(&self, container_id: &ContainerId) -> Result<Option<ContainerTermination>, CoreError>;

    /// Kills everything in the boundary. Returns `false` for an unknown id.
    async fn destroy(&self, container_id: &ContainerId) -> Result<bool, CoreError>;

    async fn containers(&self) -> Result<Vec<ContainerId>, CoreError>;
}
