//! Metrics collection abstraction for the agent.
//!
//! Backends (prometheus, statsd, etc) implement [`MetricsBackend`] and are handed to the agent builder.
mod backend;
pub use backend::{LaunchErrorKind, MetricsBackend, MetricsHandle, RegistrationKind};

mod noop;
pub use noop::NoOpMetrics;

use std::sync::Arc;

/// Create a no-op metrics handle.
#[inline]
pub fn noop_metrics() -> MetricsHandle {
    Arc::new(NoOpMetrics)
}
