use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use berth_model::{BackoffStrategy, ExecutorId, FrameworkId, StatusUpdate, TaskId, UpdateUuid};

use super::error::StatusUpdateError;
use super::stream::{Enqueued, UpdateStream};
use crate::clock::ClockHandle;
use crate::collab::{StateStore, UpdateRecord};
use crate::metrics::MetricsHandle;
use crate::timer::Timer;

/// Hands an update to whoever talks to the controller.
pub type ForwardFn = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Result of an accepted acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// The acknowledged update was terminal: the stream is gone and the
    /// task may be purged.
    pub terminal: bool,
}

/// Persisted log of one task, fed back after a restart.
#[derive(Debug, Clone)]
pub struct RecoveredStream {
    pub framework_id: FrameworkId,
    pub executor_id: Option<ExecutorId>,
    pub task_id: TaskId,
    pub updates: Vec<StatusUpdate>,
    pub acknowledged: Vec<UpdateUuid>,
}

type StreamKey = (FrameworkId, TaskId);

enum Command {
    Update {
        update: StatusUpdate,
        checkpoint: bool,
        reply: oneshot::Sender<Result<(), StatusUpdateError>>,
    },
    Acknowledge {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
        reply: oneshot::Sender<Result<AckOutcome, StatusUpdateError>>,
    },
    Recover {
        streams: Vec<RecoveredStream>,
        reply: oneshot::Sender<()>,
    },
    Pause,
    Resume,
    Cleanup {
        framework_id: FrameworkId,
    },
    Retry {
        key: StreamKey,
        seq: u64,
    },
}

/// Handle to the status update manager actor.
///
/// The manager starts paused: nothing reaches the controller until the
/// agent has registered and calls [`StatusUpdateManager::resume`].
#[derive(Clone)]
pub struct StatusUpdateManager {
    tx: mpsc::UnboundedSender<Command>,
}

impl StatusUpdateManager {
    pub fn spawn(
        retry: BackoffStrategy,
        clock: ClockHandle,
        metrics: MetricsHandle,
        store: Option<Arc<dyn StateStore>>,
        forward: ForwardFn,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            retry,
            clock,
            metrics,
            store,
            forward,
            tx: tx.clone(),
            streams: HashMap::new(),
            retired: HashMap::new(),
            paused: true,
        };
        tokio::spawn(actor.run(rx, cancel));
        Self { tx }
    }

    /// Persists (when `checkpoint`) and enqueues `update`. Resolves once the
    /// update is durable, so the sender may be acknowledged.
    pub async fn update(&self, update: StatusUpdate, checkpoint: bool) -> Result<(), StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            update,
            checkpoint,
            reply,
        })?;
        rx.await.map_err(|_| StatusUpdateError::ManagerGone)?
    }

    pub async fn acknowledge(
        &self,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    ) -> Result<AckOutcome, StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acknowledge {
            framework_id,
            task_id,
            uuid,
            reply,
        })?;
        rx.await.map_err(|_| StatusUpdateError::ManagerGone)?
    }

    pub async fn recover(&self, streams: Vec<RecoveredStream>) -> Result<(), StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Recover { streams, reply })?;
        rx.await.map_err(|_| StatusUpdateError::ManagerGone)
    }

    /// Stops forwarding; retries resume from the first interval later.
    pub fn pause(&self) {
        let _ = self.send(Command::Pause);
    }

    /// Forwards the head of every stream.
    pub fn resume(&self) {
        let _ = self.send(Command::Resume);
    }

    /// Drops every stream of a removed framework.
    pub fn cleanup(&self, framework_id: FrameworkId) {
        let _ = self.send(Command::Cleanup { framework_id });
    }

    fn send(&self, command: Command) -> Result<(), StatusUpdateError> {
        self.tx.send(command).map_err(|_| StatusUpdateError::ManagerGone)
    }
}

struct ManagerActor {
    retry: BackoffStrategy,
    clock: ClockHandle,
    metrics: MetricsHandle,
    store: Option<Arc<dyn StateStore>>,
    forward: ForwardFn,
    tx: mpsc::UnboundedSender<Command>,
    streams: HashMap<StreamKey, UpdateStream>,
    /// Tasks whose terminal update was acknowledged, per framework.
    retired: HashMap<FrameworkId, HashSet<TaskId>>,
    paused: bool,
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        debug!("status update manager stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Update {
                update,
                checkpoint,
                reply,
            } => {
                let _ = reply.send(self.on_update(update, checkpoint).await);
            }
            Command::Acknowledge {
                framework_id,
                task_id,
                uuid,
                reply,
            } => {
                let _ = reply.send(self.on_acknowledge((framework_id, task_id), uuid).await);
            }
            Command::Recover { streams, reply } => {
                self.on_recover(streams);
                let _ = reply.send(());
            }
            Command::Pause => {
                if !self.paused {
                    info!(streams = self.streams.len(), "pausing status update delivery");
                }
                self.paused = true;
            }
            Command::Resume => self.on_resume(),
            Command::Cleanup { framework_id } => {
                self.streams.retain(|(fid, _), _| fid != &framework_id);
                self.retired.remove(&framework_id);
                debug!(framework = %framework_id, "status update streams cleaned up");
            }
            Command::Retry { key, seq } => self.on_retry(key, seq),
        }
    }

    #[instrument(level = "debug", skip_all, fields(framework = %update.framework_id, task = %update.task_id(), state = %update.state(), uuid = %update.uuid))]
    async fn on_update(&mut self, update: StatusUpdate, checkpoint: bool) -> Result<(), StatusUpdateError> {
        let key = (update.framework_id.clone(), update.task_id().clone());
        if self
            .retired
            .get(&key.0)
            .is_some_and(|tasks| tasks.contains(&key.1))
        {
            return Err(StatusUpdateError::Terminated { task_id: key.1 });
        }

        let first = self.retry.first();
        let stream = self.streams.entry(key.clone()).or_insert_with(|| {
            UpdateStream::new(
                update.framework_id.clone(),
                update.executor_id.clone(),
                update.task_id().clone(),
                checkpoint,
                first,
            )
        });
        stream.check(&update)?;

        if stream.checkpoint {
            if let (Some(store), Some(executor_id)) = (&self.store, &stream.executor_id) {
                store
                    .append_update(
                        &stream.framework_id,
                        executor_id,
                        &stream.task_id,
                        UpdateRecord::Update { update: update.clone() },
                    )
                    .await
                    .map_err(|e| StatusUpdateError::Persistence(e.to_string()))?;
            }
        }

        if stream.enqueue(update)? == Enqueued::Head {
            stream.interval = first;
            self.deliver(&key);
        } else {
            trace!("update queued behind unacknowledged head");
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(framework = %key.0, task = %key.1))]
    async fn on_acknowledge(&mut self, key: StreamKey, uuid: UpdateUuid) -> Result<AckOutcome, StatusUpdateError> {
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(StatusUpdateError::UnknownStream { task_id: key.1 });
        };
        stream.check_ack(uuid)?;

        if stream.checkpoint {
            if let (Some(store), Some(executor_id)) = (&self.store, &stream.executor_id) {
                store
                    .append_update(
                        &stream.framework_id,
                        executor_id,
                        &stream.task_id,
                        UpdateRecord::Ack { uuid },
                    )
                    .await
                    .map_err(|e| StatusUpdateError::Persistence(e.to_string()))?;
            }
        }

        let acked = stream.acknowledge(uuid)?;
        if acked.terminal {
            if acked.next.is_some() {
                warn!("updates queued behind an acknowledged terminal update are dropped");
            }
            self.streams.remove(&key);
            self.retired.entry(key.0).or_default().insert(key.1);
        } else if acked.next.is_some() {
            stream.interval = self.retry.first();
            self.deliver(&key);
        }
        Ok(AckOutcome {
            terminal: acked.terminal,
        })
    }

    fn on_recover(&mut self, recovered: Vec<RecoveredStream>) {
        let first = self.retry.first();
        for r in recovered {
            let key = (r.framework_id.clone(), r.task_id.clone());
            let stream = UpdateStream::new(r.framework_id, r.executor_id, r.task_id, true, first)
                .replay(r.updates, r.acknowledged);
            if stream.is_terminated() {
                self.retired.entry(key.0).or_default().insert(key.1);
            } else {
                self.streams.insert(key, stream);
            }
        }
        info!(streams = self.streams.len(), "recovered status update streams");
    }

    fn on_resume(&mut self) {
        self.paused = false;
        let keys: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, s)| s.head().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        info!(pending = keys.len(), "resuming status update delivery");

        let first = self.retry.first();
        for key in keys {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.interval = first;
            }
            self.deliver(&key);
        }
    }

    fn on_retry(&mut self, key: StreamKey, seq: u64) {
        if self.paused {
            return;
        }
        let retry = self.retry.clone();
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if stream.timer_seq != seq || stream.head().is_none() {
            return;
        }
        stream.interval = retry.next(stream.interval);
        self.metrics.record_status_update_retry();
        debug!(framework = %key.0, task = %key.1, interval = ?stream.interval, "retrying status update");
        self.deliver(&key);
    }

    /// Forwards the head of `key` (unless paused) and re-arms its timer.
    fn deliver(&mut self, key: &StreamKey) {
        let Some(stream) = self.streams.get_mut(key) else {
            return;
        };
        let Some(head) = stream.head().cloned() else {
            stream.timer = None;
            return;
        };
        if self.paused {
            stream.timer = None;
            return;
        }

        (self.forward)(head);

        stream.timer_seq += 1;
        let delay = jittered(&self.retry, stream.interval);
        stream.timer = Some(Timer::schedule(
            &self.clock,
            delay,
            self.tx.clone(),
            Command::Retry {
                key: key.clone(),
                seq: stream.timer_seq,
            },
        ));
    }
}

fn jittered(retry: &BackoffStrategy, interval: Duration) -> Duration {
    retry.jitter.apply(interval, rand::random::<f64>())
}
