//! Time source injected into every component that owns a timer.
//!
//! [`TokioClock`] sleeps on the tokio timer, so tests that run with a paused
//! runtime (`#[tokio::test(start_paused = true)]`) drive retries and
//! timeouts deterministically.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Resolves after `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);

    /// Wall time in seconds since the unix epoch, used to stamp statuses.
    fn timestamp(&self) -> f64;
}

pub type ClockHandle = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    fn timestamp(&self) -> f64 {
        OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
    }
}

#[inline]
pub fn tokio_clock() -> ClockHandle {
    Arc::new(TokioClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_follows_paused_time() {
        let clock = tokio_clock();
        let start = clock.now();
        clock.sleep(Duration::from_secs(600)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(600));
    }

    #[test]
    fn timestamp_is_after_2020() {
        assert!(TokioClock.timestamp() > 1_577_836_800.0);
    }
}
