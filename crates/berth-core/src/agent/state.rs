//! In-memory records owned by the agent actor.
use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::warn;

use berth_model::message::ExecutorCommand;
use berth_model::{
    ContainerId, ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, Reason, Resources, TaskId, TaskInfo,
    TaskState, UpdateUuid,
};

use crate::collab::ExecutorLinkRef;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    /// Rebuilding state after a restart; controller traffic is ignored.
    Recovering,
    /// No accepted registration with the current leader.
    Disconnected,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameworkState {
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutorState {
    Registering,
    Running,
    Terminating,
    Terminated,
}

/// One task as the agent tracks it.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub(crate) info: TaskInfo,
    pub(crate) state: TaskState,
    /// Handed to the executor.
    pub(crate) forwarded: bool,
    pub(crate) kill_requested: bool,
    /// Updates sent to the controller and not yet acknowledged, oldest first.
    pub(crate) unacknowledged: VecDeque<(TaskState, UpdateUuid)>,
    pub(crate) acknowledged: Option<(TaskState, UpdateUuid)>,
}

impl Task {
    pub(crate) fn new(info: TaskInfo) -> Self {
        Self {
            info,
            state: TaskState::Staging,
            forwarded: false,
            kill_requested: false,
            unacknowledged: VecDeque::new(),
            acknowledged: None,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> &TaskId {
        &self.info.task_id
    }

    pub(crate) fn record_update(&mut self, state: TaskState, uuid: UpdateUuid) {
        self.state = state;
        self.unacknowledged.push_back((state, uuid));
    }

    pub(crate) fn record_ack(&mut self, uuid: UpdateUuid) {
        if let Some(pos) = self.unacknowledged.iter().position(|(_, u)| *u == uuid) {
            if let Some(entry) = self.unacknowledged.remove(pos) {
                self.acknowledged = Some(entry);
            }
        }
    }

    /// The update being delivered, or the last acknowledged one.
    pub(crate) fn status_update_marker(&self) -> Option<(TaskState, UpdateUuid)> {
        self.unacknowledged.front().copied().or(self.acknowledged)
    }
}

/// Terminal outcome decided before the boundary actually goes away.
#[derive(Debug, Clone)]
pub(crate) struct PendingTermination {
    pub(crate) state: TaskState,
    pub(crate) reason: Reason,
    pub(crate) message: String,
}

/// Tasks forwarded together: a single task or a whole group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LaunchUnit {
    pub(crate) task_ids: Vec<TaskId>,
    pub(crate) group: bool,
}

pub(crate) struct Executor {
    pub(crate) info: ExecutorInfo,
    pub(crate) framework_id: FrameworkId,
    pub(crate) container_id: ContainerId,
    pub(crate) state: ExecutorState,
    pub(crate) link: Option<ExecutorLinkRef>,
    /// Live tasks, queued or forwarded.
    pub(crate) tasks: HashMap<TaskId, Task>,
    /// Units not yet handed to the executor, in arrival order.
    pub(crate) queue: Vec<LaunchUnit>,
    /// Terminal tasks waiting for their acknowledgement.
    pub(crate) terminated: HashMap<TaskId, Task>,
    pub(crate) completed: VecDeque<Task>,
    pub(crate) pending_termination: Option<PendingTermination>,
    pub(crate) registration_timer: Option<Timer>,
    pub(crate) shutdown_timer: Option<Timer>,
    /// Rebuilt from a checkpoint; must re-register instead of register.
    pub(crate) recovered: bool,
    pub(crate) reregistered: bool,
}

impl Executor {
    pub(crate) fn new(info: ExecutorInfo, framework_id: FrameworkId, container_id: ContainerId) -> Self {
        Self {
            info,
            framework_id,
            container_id,
            state: ExecutorState::Registering,
            link: None,
            tasks: HashMap::new(),
            queue: Vec::new(),
            terminated: HashMap::new(),
            completed: VecDeque::new(),
            pending_termination: None,
            registration_timer: None,
            shutdown_timer: None,
            recovered: false,
            reregistered: false,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> &ExecutorId {
        &self.info.executor_id
    }

    pub(crate) fn is_queued(&self, task_id: &TaskId) -> bool {
        self.queue.iter().any(|u| u.task_ids.contains(task_id))
    }

    /// Removes and returns the queued unit holding `task_id`.
    pub(crate) fn dequeue_unit(&mut self, task_id: &TaskId) -> Option<LaunchUnit> {
        let pos = self.queue.iter().position(|u| u.task_ids.contains(task_id))?;
        Some(self.queue.remove(pos))
    }

    /// Grant covering the executor itself and every live task.
    pub(crate) fn allocated(&self) -> Resources {
        let mut total = self.info.resources.clone();
        for task in self.tasks.values() {
            total.add(&task.info.resources);
        }
        total
    }

    /// Live task ids, queued units first in arrival order, then the rest.
    pub(crate) fn live_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.queue.iter().flat_map(|u| u.task_ids.iter().cloned()).collect();
        let mut rest: Vec<TaskId> = self.tasks.keys().filter(|id| !ids.contains(id)).cloned().collect();
        rest.sort();
        ids.extend(rest);
        ids
    }

    /// Moves a task that just turned terminal out of the live set.
    pub(crate) fn retire_task(&mut self, task_id: &TaskId) {
        for unit in &mut self.queue {
            unit.task_ids.retain(|id| id != task_id);
        }
        self.queue.retain(|u| !u.task_ids.is_empty());
        if let Some(task) = self.tasks.remove(task_id) {
            self.terminated.insert(task_id.clone(), task);
        }
    }

    pub(crate) fn complete_task(&mut self, task_id: &TaskId, max_completed: usize) {
        if let Some(task) = self.terminated.remove(task_id) {
            self.completed.push_back(task);
            while self.completed.len() > max_completed {
                self.completed.pop_front();
            }
        }
    }

    pub(crate) fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id).or_else(|| self.terminated.get(task_id))
    }

    pub(crate) fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut Task> {
        match self.tasks.get_mut(task_id) {
            Some(task) => Some(task),
            None => self.terminated.get_mut(task_id),
        }
    }

    /// Terminated and nothing left to acknowledge.
    pub(crate) fn is_done(&self) -> bool {
        self.state == ExecutorState::Terminated && self.tasks.is_empty() && self.terminated.is_empty()
    }

    /// Sends over the executor's channel. A failed send marks the executor
    /// disconnected.
    pub(crate) fn send(&mut self, command: ExecutorCommand) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(executor = %self.info.executor_id, error = %e, "executor channel is gone; marking disconnected");
                self.link = None;
                false
            }
        }
    }

    pub(crate) fn cancel_timers(&mut self) {
        self.registration_timer = None;
        self.shutdown_timer = None;
    }
}

/// A task parked while its executor's secret is being generated.
#[derive(Debug, Clone)]
pub(crate) struct PendingTask {
    pub(crate) info: TaskInfo,
    pub(crate) executor_id: ExecutorId,
    /// Every task of the same launch, `self` included.
    pub(crate) siblings: Vec<TaskId>,
}

pub(crate) struct Framework {
    pub(crate) info: FrameworkInfo,
    pub(crate) state: FrameworkState,
    pub(crate) executors: HashMap<ExecutorId, Executor>,
    pub(crate) pending: HashMap<TaskId, PendingTask>,
    /// Tasks that failed before reaching any executor, awaiting acknowledgement.
    pub(crate) unrouted: HashMap<TaskId, Task>,
    pub(crate) completed_executors: VecDeque<super::snapshot::ExecutorSnapshot>,
}

impl Framework {
    pub(crate) fn new(info: FrameworkInfo) -> Self {
        Self {
            info,
            state: FrameworkState::Running,
            executors: HashMap::new(),
            pending: HashMap::new(),
            unrouted: HashMap::new(),
            completed_executors: VecDeque::new(),
        }
    }

    /// State for tasks lost to a failure they did not cause.
    pub(crate) fn collateral_state(&self) -> TaskState {
        if self.info.is_partition_aware() {
            TaskState::Gone
        } else {
            TaskState::Lost
        }
    }

    /// State for tasks rejected before they reached an executor.
    pub(crate) fn dropped_state(&self) -> TaskState {
        if self.info.is_partition_aware() {
            TaskState::Dropped
        } else {
            TaskState::Lost
        }
    }

    /// Executor holding `task_id`, live or terminated.
    pub(crate) fn executor_of(&self, task_id: &TaskId) -> Option<&ExecutorId> {
        self.executors
            .iter()
            .find(|(_, e)| e.task(task_id).is_some())
            .map(|(id, _)| id)
    }

    pub(crate) fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.unrouted
            .get(task_id)
            .or_else(|| self.executors.values().find_map(|e| e.task(task_id)))
    }

    pub(crate) fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut Task> {
        if self.unrouted.contains_key(task_id) {
            return self.unrouted.get_mut(task_id);
        }
        self.executors.values_mut().find_map(|e| e.task_mut(task_id))
    }

    pub(crate) fn knows(&self, task_id: &TaskId) -> bool {
        self.pending.contains_key(task_id) || self.task(task_id).is_some()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.executors.is_empty() && self.pending.is_empty() && self.unrouted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_model::CommandInfo;

    fn task(id: &str) -> Task {
        Task::new(TaskInfo::command(id, CommandInfo::shell("true"), "cpus:1".parse().unwrap()))
    }

    #[test]
    fn marker_prefers_the_update_in_flight() {
        let mut t = task("t1");
        assert_eq!(t.status_update_marker(), None);

        let running = UpdateUuid::random();
        let finished = UpdateUuid::random();
        t.record_update(TaskState::Running, running);
        t.record_update(TaskState::Finished, finished);
        assert_eq!(t.state, TaskState::Finished);
        assert_eq!(t.status_update_marker(), Some((TaskState::Running, running)));

        t.record_ack(running);
        assert_eq!(t.status_update_marker(), Some((TaskState::Finished, finished)));
        t.record_ack(finished);
        assert_eq!(t.status_update_marker(), Some((TaskState::Finished, finished)));
    }

    #[test]
    fn retiring_a_group_member_keeps_the_rest_queued() {
        let fw = FrameworkId::from("fw");
        let info = ExecutorInfo::custom("ex", CommandInfo::shell("exec"), "cpus:0.1".parse().unwrap());
        let mut exec = Executor::new(info, fw, ContainerId::new("c"));
        for id in ["a", "b"] {
            exec.tasks.insert(TaskId::from(id), task(id));
        }
        exec.queue.push(LaunchUnit {
            task_ids: vec![TaskId::from("a"), TaskId::from("b")],
            group: true,
        });

        assert!((exec.allocated().get("cpus") - 2.1).abs() < 1e-9);
        exec.retire_task(&TaskId::from("a"));
        assert!(exec.is_queued(&TaskId::from("b")));
        assert!(exec.terminated.contains_key(&TaskId::from("a")));
        assert_eq!(exec.live_task_ids(), vec![TaskId::from("b")]);
    }
}
