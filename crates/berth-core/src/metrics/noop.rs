use berth_model::TaskState;

use crate::metrics::backend::{LaunchErrorKind, MetricsBackend, RegistrationKind};

/// No-op metrics backend that compiles to nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsBackend for NoOpMetrics {
    #[inline(always)]
    fn record_task_terminal(&self, _: TaskState) {}

    #[inline(always)]
    fn record_executor_terminated(&self) {}

    #[inline(always)]
    fn record_status_update_retry(&self) {}

    #[inline(always)]
    fn record_invalid_acknowledgement(&self) {}

    #[inline(always)]
    fn record_ping_timeout(&self) {}

    #[inline(always)]
    fn record_registration_attempt(&self, _: RegistrationKind) {}

    #[inline(always)]
    fn record_launch_error(&self, _: LaunchErrorKind) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_is_zero_size() {
        assert_eq!(std::mem::size_of::<NoOpMetrics>(), 0);
    }
}
