//! Process-backed execution for the berth agent.
//!
//! [`ProcessContainerizer`] implements the agent's containerizer on top of a
//! [`Launcher`], and runs command tasks through a built-in executor that
//! speaks the regular executor protocol.
mod command;
mod usage;

pub mod containerizer;
pub mod error;
pub mod hooks;
pub mod launcher;

pub use containerizer::{ContainerizerConfig, ProcessContainerizer};
pub use error::ExecError;
pub use launcher::{LaunchRequest, Launcher, LauncherKind, LauncherRef, MinimalLauncher, PosixLauncher, Redirect};
