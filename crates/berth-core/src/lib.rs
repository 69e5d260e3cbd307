pub mod agent;
pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod status_update;
pub mod timer;
pub mod versions;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub mod prelude {
    pub use crate::agent::{Agent, AgentBuilder, AgentHandle, AgentSnapshot, mailbox};
    pub use crate::clock::{Clock, ClockHandle, tokio_clock};
    pub use crate::collab::{Containerizer, ControllerDetector, ControllerLink, ExecutorLink, StateStore};
    pub use crate::config::AgentConfig;
    pub use crate::error::CoreError;
    pub use crate::metrics::{MetricsBackend, MetricsHandle};
}
