use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use berth_model::{BackoffStrategy, JitterStrategy, Resources};

use crate::error::CoreError;

/// Agent policy knobs.
///
/// Every timing constant of the registration, health and delivery
/// protocols lives here so operators can tune it without a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Resources advertised for this node, `name:value;...`.
    pub resources: String,
    /// Root of checkpointed state.
    pub work_dir: PathBuf,
    /// Root of runtime state (pid files, exit status files).
    pub runtime_dir: PathBuf,
    /// Upper bound of the first, randomised registration delay.
    pub registration_backoff_factor_ms: u64,
    /// Cap for the doubling registration retry interval.
    pub registration_retry_max_ms: u64,
    /// Expected interval between controller pings.
    pub ping_timeout_ms: u64,
    /// Missed pings tolerated before the controller is considered gone.
    pub max_ping_timeouts: u32,
    pub executor_registration_timeout_ms: u64,
    /// Window after a restart in which recovered executors may re-register.
    pub executor_reregistration_timeout_ms: u64,
    /// Ignore (rather than shut down) executors that re-register twice.
    pub executor_reregistration_retry: bool,
    pub executor_shutdown_grace_period_ms: u64,
    pub status_update_retry: BackoffStrategy,
    pub max_completed_executors_per_framework: usize,
    pub max_completed_tasks_per_executor: usize,
    pub max_completed_frameworks: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resources: "cpus:1;mem:1024".to_string(),
            work_dir: PathBuf::from("/var/lib/berth"),
            runtime_dir: PathBuf::from("/var/run/berth"),
            registration_backoff_factor_ms: 1_000,
            registration_retry_max_ms: 60_000,
            ping_timeout_ms: 15_000,
            max_ping_timeouts: 5,
            executor_registration_timeout_ms: 60_000,
            executor_reregistration_timeout_ms: 2_000,
            executor_reregistration_retry: false,
            executor_shutdown_grace_period_ms: 5_000,
            status_update_retry: BackoffStrategy {
                jitter: JitterStrategy::None,
                first_ms: 10_000,
                max_ms: 600_000,
                factor: 2.0,
            },
            max_completed_executors_per_framework: 150,
            max_completed_tasks_per_executor: 200,
            max_completed_frameworks: 50,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.parsed_resources()?;
        if self.ping_timeout_ms == 0 || self.max_ping_timeouts == 0 {
            return Err(CoreError::Config(
                "pingTimeoutMs and maxPingTimeouts must be positive".into(),
            ));
        }
        if self.status_update_retry.first_ms == 0 {
            return Err(CoreError::Config(
                "statusUpdateRetry.firstMs must be positive".into(),
            ));
        }
        if self.executor_registration_timeout_ms == 0 {
            return Err(CoreError::Config(
                "executorRegistrationTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn parsed_resources(&self) -> Result<Resources, CoreError> {
        Ok(Resources::parse(&self.resources)?)
    }

    pub fn registration_backoff_factor(&self) -> Duration {
        Duration::from_millis(self.registration_backoff_factor_ms)
    }

    pub fn registration_retry_max(&self) -> Duration {
        Duration::from_millis(self.registration_retry_max_ms)
    }

    /// Silence tolerated before the agent gives up on the controller.
    pub fn ping_window(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms) * self.max_ping_timeouts
    }

    pub fn executor_registration_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_registration_timeout_ms)
    }

    pub fn executor_reregistration_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_reregistration_timeout_ms)
    }

    pub fn executor_shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.executor_shutdown_grace_period_ms)
    }
}
