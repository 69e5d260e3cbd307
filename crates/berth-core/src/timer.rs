use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::clock::ClockHandle;

/// One-shot timer that posts an event into an actor mailbox.
///
/// Dropping the timer cancels it. An event already posted stays in the
/// mailbox, so handlers still compare it against current state.
#[derive(Debug)]
pub struct Timer {
    cancel: CancellationToken,
}

impl Timer {
    pub fn schedule<E>(clock: &ClockHandle, delay: Duration, tx: UnboundedSender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let clock = clock.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = clock.sleep(delay) => {
                    let _ = tx.send(event);
                }
            }
        });
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tokio_clock;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::schedule(&tokio_clock(), Duration::from_secs(5), tx, 7u32);

        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::schedule(&tokio_clock(), Duration::from_secs(5), tx.clone(), 1u32);
        drop(timer);
        let _later = Timer::schedule(&tokio_clock(), Duration::from_secs(10), tx, 2u32);

        assert_eq!(rx.recv().await, Some(2));
    }
}
