//! Logging for the berth agent.
//!
//! [`init_logger`] installs the process-wide `tracing` subscriber. With the
//! `subscriber` feature, [`Subscriber`] turns taskvisor supervision events
//! into log lines.
mod logger;
pub use logger::*;

#[cfg(feature = "subscriber")]
mod subscriber;

#[cfg(feature = "subscriber")]
pub use subscriber::Subscriber;
