//! Log sink for the daemon's supervisor.
//!
//! The agent, its detector and the HTTP server run as taskvisor tasks; this
//! subscriber reports their lifecycle through `tracing`.
use async_trait::async_trait;
use taskvisor::{Event, EventKind, Subscribe};
use tracing::{debug, error, info, trace, warn};

/// Logs every supervisor event with the task name and attempt as fields.
#[derive(Debug, Default)]
pub struct Subscriber;

const QUEUE_CAPACITY: usize = 1024;

#[async_trait]
impl Subscribe for Subscriber {
    async fn on_event(&self, event: &Event) {
        log_event(event);
    }

    fn name(&self) -> &'static str {
        "berth-log"
    }

    fn queue_capacity(&self) -> usize {
        QUEUE_CAPACITY
    }
}

fn log_event(e: &Event) {
    let task = e.task.as_deref().unwrap_or("-");
    let reason = e.reason.as_deref().unwrap_or("-");
    let attempt = e.attempt.unwrap_or(0);
    let msg = describe(e.kind);

    match e.kind {
        EventKind::TaskAddRequested | EventKind::TaskRemoveRequested | EventKind::TaskRemoved => {
            trace!(task, "{msg}")
        }
        EventKind::TaskAdded => debug!(task, "{msg}"),
        EventKind::TaskStopped => debug!(task, "{msg}"),
        EventKind::TaskStarting => info!(task, attempt, "{msg}"),
        EventKind::TaskFailed => error!(task, attempt, reason, "{msg}"),
        EventKind::TimeoutHit => warn!(task, timeout_ms = e.timeout_ms.unwrap_or(0), "{msg}"),
        EventKind::BackoffScheduled => debug!(task, attempt, delay_ms = e.delay_ms.unwrap_or(0), reason, "{msg}"),
        EventKind::ActorExhausted => warn!(task, reason, "{msg}"),
        EventKind::ActorDead => error!(task, reason, "{msg}"),

        EventKind::ShutdownRequested | EventKind::AllStoppedWithinGrace => info!("{msg}"),
        EventKind::GraceExceeded => warn!("{msg}"),

        EventKind::SubscriberPanicked | EventKind::SubscriberOverflow => error!(task, reason, "{msg}"),

        EventKind::ControllerRejected => warn!(task, reason, "{msg}"),
        EventKind::ControllerSubmitted => trace!(task, "{msg}"),
        EventKind::ControllerSlotTransition => debug!(task, reason, "{msg}"),
    }
}

fn describe(kind: EventKind) -> &'static str {
    match kind {
        EventKind::TaskAddRequested => "task add requested",
        EventKind::TaskAdded => "task added",
        EventKind::TaskRemoveRequested => "task removal requested",
        EventKind::TaskRemoved => "task removed",
        EventKind::TaskStarting => "task starting",
        EventKind::TaskStopped => "task stopped",
        EventKind::TaskFailed => "task failed",
        EventKind::TimeoutHit => "task timed out",
        EventKind::BackoffScheduled => "restart scheduled",
        EventKind::ActorExhausted => "task will not be restarted",
        EventKind::ActorDead => "task died",
        EventKind::ShutdownRequested => "shutdown requested",
        EventKind::AllStoppedWithinGrace => "all tasks stopped within grace",
        EventKind::GraceExceeded => "tasks did not stop within grace",
        EventKind::SubscriberPanicked => "event subscriber panicked",
        EventKind::SubscriberOverflow => "event subscriber dropped an event",
        EventKind::ControllerRejected => "submission rejected",
        EventKind::ControllerSubmitted => "task submitted",
        EventKind::ControllerSlotTransition => "slot changed state",
    }
}
