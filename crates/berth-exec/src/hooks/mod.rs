//! `pre_exec` hooks run in the child between `fork()` and `execve()`.
mod log;

mod custom;
pub use custom::{PreExecHook, attach_hooks};

mod rlimits;
pub use rlimits::{RlimitConfig, attach_rlimits};

mod session;
pub use session::attach_session;
