mod env;
pub use env::{Env, EnvVar};

mod labels;
pub use labels::Labels;

/// Duration expressed in milliseconds, as carried on the wire.
pub type DurationMs = u64;
