use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use berth_model::{ExecutorId, FrameworkId, StatusUpdate, TaskId, UpdateUuid};

use super::error::StatusUpdateError;
use crate::timer::Timer;

/// Where an accepted update landed in its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    /// It is the head and must be forwarded now.
    Head,
    /// It waits behind older updates.
    Queued,
}

#[derive(Debug)]
pub(crate) struct Acknowledged {
    pub(crate) terminal: bool,
    /// New head, if any.
    pub(crate) next: Option<StatusUpdate>,
}

/// Ordered, deduplicated updates of one task.
#[derive(Debug)]
pub(crate) struct UpdateStream {
    pub(crate) framework_id: FrameworkId,
    pub(crate) executor_id: Option<ExecutorId>,
    pub(crate) task_id: TaskId,
    pub(crate) checkpoint: bool,
    pending: VecDeque<StatusUpdate>,
    received: HashSet<UpdateUuid>,
    acknowledged: HashSet<UpdateUuid>,
    terminated: bool,
    /// Current retry interval of the head.
    pub(crate) interval: Duration,
    pub(crate) timer: Option<Timer>,
    /// Bumped whenever the retry timer is re-armed.
    pub(crate) timer_seq: u64,
}

impl UpdateStream {
    pub(crate) fn new(
        framework_id: FrameworkId,
        executor_id: Option<ExecutorId>,
        task_id: TaskId,
        checkpoint: bool,
        interval: Duration,
    ) -> Self {
        Self {
            framework_id,
            executor_id,
            task_id,
            checkpoint,
            pending: VecDeque::new(),
            received: HashSet::new(),
            acknowledged: HashSet::new(),
            terminated: false,
            interval,
            timer: None,
            timer_seq: 0,
        }
    }

    /// Rebuilds a stream from a persisted log.
    pub(crate) fn replay(
        mut self,
        updates: impl IntoIterator<Item = StatusUpdate>,
        acknowledged: impl IntoIterator<Item = UpdateUuid>,
    ) -> Self {
        self.acknowledged.extend(acknowledged);
        for update in updates {
            self.received.insert(update.uuid);
            if self.acknowledged.contains(&update.uuid) {
                if update.is_terminal() {
                    self.terminated = true;
                }
            } else {
                self.pending.push_back(update);
            }
        }
        self
    }

    pub(crate) fn head(&self) -> Option<&StatusUpdate> {
        self.pending.front()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Rejects `update` if the stream cannot accept it.
    pub(crate) fn check(&self, update: &StatusUpdate) -> Result<(), StatusUpdateError> {
        if self.terminated {
            return Err(StatusUpdateError::Terminated {
                task_id: self.task_id.clone(),
            });
        }
        if self.received.contains(&update.uuid) {
            return Err(StatusUpdateError::Duplicate { uuid: update.uuid });
        }
        Ok(())
    }

    pub(crate) fn enqueue(&mut self, update: StatusUpdate) -> Result<Enqueued, StatusUpdateError> {
        self.check(&update)?;
        self.received.insert(update.uuid);
        self.pending.push_back(update);
        Ok(if self.pending.len() == 1 {
            Enqueued::Head
        } else {
            Enqueued::Queued
        })
    }

    /// Validates `uuid` against the head without popping it.
    pub(crate) fn check_ack(&self, uuid: UpdateUuid) -> Result<(), StatusUpdateError> {
        if self.acknowledged.contains(&uuid) {
            return Err(StatusUpdateError::Duplicate { uuid });
        }
        match self.pending.front() {
            Some(head) if head.uuid == uuid => Ok(()),
            head => Err(StatusUpdateError::UnexpectedAcknowledgement {
                expected: head.map(|h| h.uuid),
                got: uuid,
            }),
        }
    }

    pub(crate) fn acknowledge(&mut self, uuid: UpdateUuid) -> Result<Acknowledged, StatusUpdateError> {
        self.check_ack(uuid)?;
        let head = self
            .pending
            .pop_front()
            .ok_or(StatusUpdateError::UnexpectedAcknowledgement { expected: None, got: uuid })?;

        self.acknowledged.insert(uuid);
        self.timer = None;

        let terminal = head.is_terminal();
        if terminal {
            self.terminated = true;
        }
        Ok(Acknowledged {
            terminal,
            next: self.pending.front().cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_model::{Source, TaskState, TaskStatus};

    fn stream() -> UpdateStream {
        UpdateStream::new(
            FrameworkId::from("fw"),
            Some(ExecutorId::from("ex")),
            TaskId::from("t1"),
            false,
            Duration::from_secs(10),
        )
    }

    fn update(state: TaskState) -> StatusUpdate {
        StatusUpdate::new(
            FrameworkId::from("fw"),
            Some(ExecutorId::from("ex")),
            TaskStatus::new(TaskId::from("t1"), state, Source::Executor),
        )
    }

    #[test]
    fn only_the_head_is_acknowledgeable() {
        let mut s = stream();
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);

        assert_eq!(s.enqueue(running.clone()).unwrap(), Enqueued::Head);
        assert_eq!(s.enqueue(finished.clone()).unwrap(), Enqueued::Queued);

        let err = s.acknowledge(finished.uuid).unwrap_err();
        assert_eq!(
            err,
            StatusUpdateError::UnexpectedAcknowledgement {
                expected: Some(running.uuid),
                got: finished.uuid
            }
        );

        let acked = s.acknowledge(running.uuid).unwrap();
        assert!(!acked.terminal);
        assert_eq!(acked.next, Some(finished.clone()));

        let acked = s.acknowledge(finished.uuid).unwrap();
        assert!(acked.terminal);
        assert!(acked.next.is_none());
        assert!(s.is_terminated());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut s = stream();
        let running = update(TaskState::Running);
        s.enqueue(running.clone()).unwrap();

        assert_eq!(
            s.enqueue(running.clone()).unwrap_err(),
            StatusUpdateError::Duplicate { uuid: running.uuid }
        );
        s.acknowledge(running.uuid).unwrap();
        assert_eq!(
            s.acknowledge(running.uuid).unwrap_err(),
            StatusUpdateError::Duplicate { uuid: running.uuid }
        );
    }

    #[test]
    fn terminated_stream_rejects_new_updates() {
        let mut s = stream();
        let killed = update(TaskState::Killed);
        s.enqueue(killed.clone()).unwrap();
        s.acknowledge(killed.uuid).unwrap();

        let again = update(TaskState::Killed);
        assert!(matches!(
            s.enqueue(again),
            Err(StatusUpdateError::Terminated { .. })
        ));
    }

    #[test]
    fn replay_restores_pending_and_terminated() {
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);

        let s = stream().replay([running.clone(), finished.clone()], [running.uuid]);
        assert_eq!(s.head(), Some(&finished));
        assert!(!s.is_terminated());

        let s = stream().replay([running.clone(), finished.clone()], [running.uuid, finished.uuid]);
        assert!(s.head().is_none());
        assert!(s.is_terminated());
        assert!(s.check(&running).is_err());
    }
}
