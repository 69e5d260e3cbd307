//! Supervised tasks of the daemon.
//!
//! Each one runs exactly once: the agent owns its mailbox and the server owns
//! its listener, so neither can be rebuilt in place. When either ends the
//! shared `stop` token brings the other down too.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use taskvisor::{BackoffPolicy, JitterPolicy, RestartPolicy, TaskError, TaskFn, TaskRef, TaskSpec};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use berth_core::agent::Agent;

pub const AGENT_TASK: &str = "berth-agent";
pub const HTTP_TASK: &str = "berth-http";

pub fn agent(agent: Agent, stop: CancellationToken) -> TaskSpec {
    once(AGENT_TASK, stop, move |cancel| async move {
        agent.run(cancel).await.map_err(|e| e.to_string())?;
        info!("agent stopped");
        Ok(())
    })
}

pub fn http(listener: TcpListener, router: Router, stop: CancellationToken) -> TaskSpec {
    once(HTTP_TASK, stop, move |cancel| async move {
        berth_api::serve(listener, router, cancel)
            .await
            .map_err(|e| format!("http server failed: {e}"))
    })
}

fn once<F, Fut>(name: &'static str, stop: CancellationToken, body: F) -> TaskSpec
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(body)));
    let task: TaskRef = TaskFn::arc(name, move |ctx: CancellationToken| {
        let body = slot.lock().ok().and_then(|mut slot| slot.take());
        let stop = stop.clone();
        async move {
            let Some(body) = body else {
                return Err(TaskError::Fatal {
                    reason: format!("{name} cannot be restarted"),
                });
            };
            let cancel = linked(&ctx, &stop);
            let result = body(cancel).await;
            stop.cancel();
            result.map_err(|reason| {
                warn!(task = name, %reason, "task ended with an error");
                TaskError::Fatal { reason }
            })
        }
    });

    TaskSpec::new(task, RestartPolicy::Never, no_backoff(), None)
}

/// Fires when either the supervisor or `stop` asks the task to end.
fn linked(ctx: &CancellationToken, stop: &CancellationToken) -> CancellationToken {
    let token = stop.child_token();
    let (ctx, watcher) = (ctx.clone(), token.clone());
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => watcher.cancel(),
            _ = watcher.cancelled() => {}
        }
    });
    token
}

fn no_backoff() -> BackoffPolicy {
    BackoffPolicy {
        first: Duration::ZERO,
        max: Duration::ZERO,
        jitter: JitterPolicy::None,
        factor: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linked_token_follows_the_supervisor() {
        let (ctx, stop) = (CancellationToken::new(), CancellationToken::new());
        let token = linked(&ctx, &stop);
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn linked_token_follows_stop() {
        let (ctx, stop) = (CancellationToken::new(), CancellationToken::new());
        let token = linked(&ctx, &stop);
        stop.cancel();
        assert!(token.is_cancelled());
    }
}
