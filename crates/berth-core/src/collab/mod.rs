//! Collaborators the agent consumes through narrow interfaces.

mod containerizer;
pub use containerizer::{
    ContainerConfig, ContainerStatus, ContainerTermination, Containerizer, ResourceStatistics,
};

mod detector;
pub use detector::{ControllerDetector, StandaloneDetector};

mod link;
pub use link::{
    ChannelControllerLink, ChannelExecutorLink, ControllerLink, ControllerLinkRef, ExecutorLink,
    ExecutorLinkRef, LoggingControllerLink,
};

mod secret;
pub use secret::{AUTHENTICATION_TOKEN_ENV, Principal, Secret, SecretGenerator, secret_value};

mod store;
pub use store::{
    FileStateStore, MemoryStateStore, RecoveredExecutor, RecoveredFramework, RecoveredState,
    RecoveredTask, StateStore, UpdateRecord,
};
