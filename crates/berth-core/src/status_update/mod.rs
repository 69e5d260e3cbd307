//! Reliable delivery of status updates to the controller.
//!
//! Each task owns one FIFO stream. Only the head is ever in flight; it is
//! resent with the same identifier on a bounded exponential schedule until
//! the controller acknowledges exactly that identifier.
mod error;
pub use error::StatusUpdateError;

mod manager;
pub use manager::{AckOutcome, ForwardFn, RecoveredStream, StatusUpdateManager};

mod stream;
