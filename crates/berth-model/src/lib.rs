mod domain;
pub use domain::{DurationMs, Env, EnvVar, Labels};

mod error;
pub use error::{ModelError, ModelResult};

mod executor;
pub use executor::{ExecutorInfo, ExecutorKind};

mod framework;
pub use framework::{FrameworkCapability, FrameworkInfo};

mod id;
pub use id::{
    AgentId, ContainerId, Endpoint, ExecutorId, FrameworkId, ResourceProviderId, TaskId, UpdateUuid,
};

pub mod message;

mod resources;
pub use resources::{Resource, Resources};

mod status;
pub use status::StatusUpdate;

mod strategy;
pub use strategy::{BackoffStrategy, JitterStrategy};

mod task;
pub use task::{CommandInfo, KillPolicy, Reason, Source, TaskInfo, TaskState, TaskStatus};

mod version;
pub use version::{ProviderState, ResourceVersion, ResourceVersionEntry};
