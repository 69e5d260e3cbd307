//! The per-node agent actor.
//!
//! One task owns every framework, executor and task record. Controller
//! messages, executor messages, timer expiries and containerizer results all
//! arrive through the same mailbox, so handlers never race each other.
//! Blocking work (containerizer calls, secret generation) runs on spawned
//! tasks that post their outcome back as a new event.

mod actor;
mod builder;
mod executors;
mod handle;
mod health;
mod launch;
mod recovery;
mod registration;
mod snapshot;
mod state;
mod updates;

pub use builder::{Agent, AgentBuilder};
pub use handle::{AgentHandle, AgentMailbox, mailbox};
pub use snapshot::{AgentSnapshot, ExecutorSnapshot, FrameworkSnapshot, TaskSnapshot};
pub use state::{AgentState, ExecutorState, FrameworkState};

#[cfg(test)]
mod tests;
