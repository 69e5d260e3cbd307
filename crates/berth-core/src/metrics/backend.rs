use std::sync::Arc;

use berth_model::TaskState;

/// Which registration message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Register,
    Reregister,
}

impl RegistrationKind {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistrationKind::Register => "register",
            RegistrationKind::Reregister => "reregister",
        }
    }
}

/// Step of a launch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    ContainerLaunch,
    ContainerUpdate,
    SecretGeneration,
    InvalidOffers,
}

impl LaunchErrorKind {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            LaunchErrorKind::ContainerLaunch => "container_launch",
            LaunchErrorKind::ContainerUpdate => "container_update",
            LaunchErrorKind::SecretGeneration => "secret_generation",
            LaunchErrorKind::InvalidOffers => "invalid_offers",
        }
    }
}

/// Agent metrics sink.
///
/// Every hook is fire-and-forget and must not block: they are called from
/// inside actor loops.
pub trait MetricsBackend: Send + Sync + 'static {
    /// A task reached a terminal state (`tasks_lost`, `tasks_gone`, ...).
    fn record_task_terminal(&self, state: TaskState);
    /// An executor's boundary was reaped.
    fn record_executor_terminated(&self);
    /// A status update was resent after its retry interval elapsed.
    fn record_status_update_retry(&self);
    /// An acknowledgement was dropped (wrong sender, unexpected uuid).
    fn record_invalid_acknowledgement(&self);
    /// The controller stopped pinging.
    fn record_ping_timeout(&self);
    fn record_registration_attempt(&self, kind: RegistrationKind);
    fn record_launch_error(&self, kind: LaunchErrorKind);
}

/// Shared handle to a metrics backend.
pub type MetricsHandle = Arc<dyn MetricsBackend>;
