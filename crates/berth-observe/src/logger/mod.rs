mod config;
mod error;
mod format;
mod install;
mod level;
mod timer;

pub use config::LoggerConfig;
pub use error::{LoggerError, LoggerResult};
pub use format::LoggerFormat;
pub use level::LoggerLevel;
pub use timer::UtcRfc3339;

/// Installs the global `tracing` subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] when a subscriber is
/// already in place, so tests and embedders can call it more than once.
///
/// ```rust
/// use berth_observe::{LoggerConfig, init_logger};
///
/// let _ = init_logger(&LoggerConfig::default());
/// tracing::info!("logger ready");
/// ```
pub fn init_logger(cfg: &LoggerConfig) -> LoggerResult<()> {
    match cfg.format {
        LoggerFormat::Text => install::text(cfg),
        LoggerFormat::Json => install::json(cfg),
        LoggerFormat::Journald => install::journald(cfg),
    }
}
