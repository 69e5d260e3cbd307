use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use super::{LoggerConfig, LoggerError, LoggerResult, UtcRfc3339};

pub(super) fn text(cfg: &LoggerConfig) -> LoggerResult<()> {
    let layer = fmt::layer()
        .with_ansi(cfg.should_use_color())
        .with_target(cfg.with_targets)
        .with_timer(UtcRfc3339);
    let subscriber = tracing_subscriber::registry()
        .with(cfg.level.to_env_filter()?)
        .with(layer);
    install(subscriber)
}

pub(super) fn json(cfg: &LoggerConfig) -> LoggerResult<()> {
    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(cfg.with_targets)
        .with_current_span(true)
        .with_timer(UtcRfc3339);
    let subscriber = tracing_subscriber::registry()
        .with(cfg.level.to_env_filter()?)
        .with(layer);
    install(subscriber)
}

#[cfg(target_os = "linux")]
pub(super) fn journald(cfg: &LoggerConfig) -> LoggerResult<()> {
    let layer = tracing_journald::layer()
        .map_err(|e| LoggerError::JournaldInitFailed(e.to_string()))?;
    let subscriber = tracing_subscriber::registry()
        .with(cfg.level.to_env_filter()?)
        .with(layer);
    install(subscriber)
}

#[cfg(not(target_os = "linux"))]
pub(super) fn journald(_cfg: &LoggerConfig) -> LoggerResult<()> {
    Err(LoggerError::JournaldNotSupported)
}

fn install<S>(subscriber: S) -> LoggerResult<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|_| LoggerError::AlreadyInitialized)
}
