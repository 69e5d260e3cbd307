//! Watches controller pings and reports a silent controller.
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::AgentEvent;
use crate::clock::ClockHandle;

enum HealthCommand {
    Arm(Duration),
    Ping,
    Disarm,
}

/// Handle to the ping watchdog.
///
/// While armed, the watchdog posts exactly one `PingTimeout` when no ping
/// was observed for a whole window, then disarms itself.
#[derive(Clone)]
pub(crate) struct HealthMonitor {
    tx: mpsc::UnboundedSender<HealthCommand>,
}

impl HealthMonitor {
    pub(crate) fn spawn(clock: ClockHandle, agent: mpsc::UnboundedSender<AgentEvent>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(watch(clock, agent, rx, cancel));
        Self { tx }
    }

    pub(crate) fn arm(&self, window: Duration) {
        let _ = self.tx.send(HealthCommand::Arm(window));
    }

    pub(crate) fn ping(&self) {
        let _ = self.tx.send(HealthCommand::Ping);
    }

    pub(crate) fn disarm(&self) {
        let _ = self.tx.send(HealthCommand::Disarm);
    }
}

fn expiry(clock: &ClockHandle, window: Option<Duration>) -> impl Future<Output = ()> + '_ {
    async move {
        match window {
            Some(w) => clock.sleep(w).await,
            None => std::future::pending::<()>().await,
        }
    }
}

async fn watch(
    clock: ClockHandle,
    agent: mpsc::UnboundedSender<AgentEvent>,
    mut rx: mpsc::UnboundedReceiver<HealthCommand>,
    cancel: CancellationToken,
) {
    let mut window: Option<Duration> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(HealthCommand::Arm(w)) => {
                    debug!(window = ?w, "ping watchdog armed");
                    window = Some(w);
                }
                // Re-entering the loop restarts the window.
                Some(HealthCommand::Ping) => {}
                Some(HealthCommand::Disarm) => window = None,
                None => break,
            },
            _ = expiry(&clock, window) => {
                warn!(window = ?window, "no ping from the controller within the window");
                window = None;
                if agent.send(AgentEvent::PingTimeout).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tokio_clock;

    fn is_timeout(ev: Option<AgentEvent>) -> bool {
        matches!(ev, Some(AgentEvent::PingTimeout))
    }

    #[tokio::test(start_paused = true)]
    async fn pings_keep_the_watchdog_quiet() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let health = HealthMonitor::spawn(tokio_clock(), tx, CancellationToken::new());
        health.arm(Duration::from_secs(75));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            health.ping();
        }
        assert!(rx.try_recv().is_err());

        let start = tokio::time::Instant::now();
        assert!(is_timeout(rx.recv().await));
        assert_eq!(start.elapsed(), Duration::from_secs(75));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_and_stays_disarmed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let health = HealthMonitor::spawn(tokio_clock(), tx, CancellationToken::new());
        health.arm(Duration::from_secs(5));

        assert!(is_timeout(rx.recv().await));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        health.disarm();
        health.ping();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
