//! Durable agent state for checkpointing frameworks.
//!
//! The agent only relies on "what was written before a crash can be read
//! back after it"; layout and encoding are a store concern.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use berth_model::{
    AgentId, ContainerId, ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, StatusUpdate, TaskId,
    TaskInfo, TaskState, UpdateUuid,
};

use crate::error::CoreError;
use crate::paths::container_path;

/// One line of a task's update log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UpdateRecord {
    Update { update: StatusUpdate },
    Ack { uuid: UpdateUuid },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveredState {
    pub agent_id: Option<AgentId>,
    pub frameworks: Vec<RecoveredFramework>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredFramework {
    pub info: FrameworkInfo,
    pub executors: Vec<RecoveredExecutor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredExecutor {
    pub info: ExecutorInfo,
    /// Latest run.
    pub container_id: ContainerId,
    pub tasks: Vec<RecoveredTask>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTask {
    pub info: TaskInfo,
    /// Every update ever recorded, oldest first.
    pub updates: Vec<StatusUpdate>,
    pub acknowledged: Vec<UpdateUuid>,
}

impl RecoveredTask {
    pub fn new(info: TaskInfo) -> Self {
        Self {
            info,
            updates: Vec::new(),
            acknowledged: Vec::new(),
        }
    }

    pub fn apply(&mut self, record: UpdateRecord) {
        match record {
            UpdateRecord::Update { update } => self.updates.push(update),
            UpdateRecord::Ack { uuid } => self.acknowledged.push(uuid),
        }
    }

    /// Updates still waiting for an acknowledgement, in delivery order.
    pub fn pending(&self) -> Vec<StatusUpdate> {
        self.updates
            .iter()
            .filter(|u| !self.acknowledged.contains(&u.uuid))
            .cloned()
            .collect()
    }

    pub fn last_acknowledged(&self) -> Option<&StatusUpdate> {
        self.updates
            .iter()
            .rev()
            .find(|u| self.acknowledged.contains(&u.uuid))
    }

    pub fn latest_state(&self) -> TaskState {
        self.updates.last().map(|u| u.state()).unwrap_or(TaskState::Staging)
    }

    /// Terminal update already acknowledged: nothing left to deliver.
    pub fn is_complete(&self) -> bool {
        self.last_acknowledged().is_some_and(|u| u.is_terminal())
    }
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn checkpoint_agent(&self, agent_id: &AgentId) -> Result<(), CoreError>;

    async fn checkpoint_framework(&self, framework: &FrameworkInfo) -> Result<(), CoreError>;

    /// Records a new run of `executor`, which becomes the latest one.
    async fn checkpoint_executor(
        &self,
        framework_id: &FrameworkId,
        executor: &ExecutorInfo,
        container_id: &ContainerId,
    ) -> Result<(), CoreError>;

    async fn checkpoint_task(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task: &TaskInfo,
    ) -> Result<(), CoreError>;

    async fn append_update(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task_id: &TaskId,
        record: UpdateRecord,
    ) -> Result<(), CoreError>;

    async fn remove_executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Result<(), CoreError>;

    async fn remove_framework(&self, framework_id: &FrameworkId) -> Result<(), CoreError>;

    async fn load(&self) -> Result<RecoveredState, CoreError>;
}

/// Store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    agent_id: Option<AgentId>,
    frameworks: BTreeMap<FrameworkId, MemoryFramework>,
}

#[derive(Debug)]
struct MemoryFramework {
    info: FrameworkInfo,
    executors: BTreeMap<ExecutorId, RecoveredExecutor>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryInner) -> Result<T, CoreError>) -> Result<T, CoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CoreError::Store("memory store poisoned".into()))?;
        f(&mut inner)
    }
}

fn unknown(what: &str, id: &impl std::fmt::Display) -> CoreError {
    CoreError::Store(format!("unknown {what} {id}"))
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn checkpoint_agent(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            inner.agent_id = Some(agent_id.clone());
            Ok(())
        })
    }

    async fn checkpoint_framework(&self, framework: &FrameworkInfo) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            inner
                .frameworks
                .entry(framework.id.clone())
                .and_modify(|f| f.info = framework.clone())
                .or_insert_with(|| MemoryFramework {
                    info: framework.clone(),
                    executors: BTreeMap::new(),
                });
            Ok(())
        })
    }

    async fn checkpoint_executor(
        &self,
        framework_id: &FrameworkId,
        executor: &ExecutorInfo,
        container_id: &ContainerId,
    ) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            let framework = inner
                .frameworks
                .get_mut(framework_id)
                .ok_or_else(|| unknown("framework", framework_id))?;
            framework.executors.insert(
                executor.executor_id.clone(),
                RecoveredExecutor {
                    info: executor.clone(),
                    container_id: container_id.clone(),
                    tasks: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn checkpoint_task(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task: &TaskInfo,
    ) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            let executor = inner
                .frameworks
                .get_mut(framework_id)
                .and_then(|f| f.executors.get_mut(executor_id))
                .ok_or_else(|| unknown("executor", executor_id))?;
            if !executor.tasks.iter().any(|t| t.info.task_id == task.task_id) {
                executor.tasks.push(RecoveredTask::new(task.clone()));
            }
            Ok(())
        })
    }

    async fn append_update(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task_id: &TaskId,
        record: UpdateRecord,
    ) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            let task = inner
                .frameworks
                .get_mut(framework_id)
                .and_then(|f| f.executors.get_mut(executor_id))
                .and_then(|e| e.tasks.iter_mut().find(|t| &t.info.task_id == task_id))
                .ok_or_else(|| unknown("task", task_id))?;
            task.apply(record);
            Ok(())
        })
    }

    async fn remove_executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            if let Some(framework) = inner.frameworks.get_mut(framework_id) {
                framework.executors.remove(executor_id);
            }
            Ok(())
        })
    }

    async fn remove_framework(&self, framework_id: &FrameworkId) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            inner.frameworks.remove(framework_id);
            Ok(())
        })
    }

    async fn load(&self) -> Result<RecoveredState, CoreError> {
        self.with_inner(|inner| {
            Ok(RecoveredState {
                agent_id: inner.agent_id.clone(),
                frameworks: inner
                    .frameworks
                    .values()
                    .map(|f| RecoveredFramework {
                        info: f.info.clone(),
                        executors: f.executors.values().cloned().collect(),
                    })
                    .collect(),
            })
        })
    }
}

const AGENT_FILE: &str = "agent.json";
const FRAMEWORK_FILE: &str = "framework.json";
const EXECUTOR_FILE: &str = "executor.json";
const LATEST_RUN_FILE: &str = "latest.json";
const TASK_FILE: &str = "task.json";
const UPDATES_FILE: &str = "updates.jsonl";

/// JSON files below a meta directory:
///
/// ```text
/// <root>/agent.json
/// <root>/frameworks/<fid>/framework.json
/// <root>/frameworks/<fid>/executors/<eid>/{executor.json, latest.json}
/// <root>/frameworks/<fid>/executors/<eid>/runs/containers/<cid>/tasks/<tid>/{task.json, updates.jsonl}
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    runs: Mutex<HashMap<(FrameworkId, ExecutorId), ContainerId>>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn framework_dir(&self, framework_id: &FrameworkId) -> PathBuf {
        self.root.join("frameworks").join(framework_id.as_str())
    }

    fn executor_dir(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> PathBuf {
        self.framework_dir(framework_id)
            .join("executors")
            .join(executor_id.as_str())
    }

    fn run_dir(&self, framework_id: &FrameworkId, executor_id: &ExecutorId, container_id: &ContainerId) -> PathBuf {
        container_path(&self.executor_dir(framework_id, executor_id).join("runs"), container_id)
    }

    fn latest_run(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Result<ContainerId, CoreError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| CoreError::Store("run index poisoned".into()))?;
        runs.get(&(framework_id.clone(), executor_id.clone()))
            .cloned()
            .ok_or_else(|| unknown("executor", executor_id))
    }

    fn remember_run(&self, framework_id: &FrameworkId, executor_id: &ExecutorId, container_id: ContainerId) -> Result<(), CoreError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| CoreError::Store("run index poisoned".into()))?;
        runs.insert((framework_id.clone(), executor_id.clone()), container_id);
        Ok(())
    }

    fn task_dir(&self, framework_id: &FrameworkId, executor_id: &ExecutorId, task_id: &TaskId) -> Result<PathBuf, CoreError> {
        let container_id = self.latest_run(framework_id, executor_id)?;
        Ok(self
            .run_dir(framework_id, executor_id, &container_id)
            .join("tasks")
            .join(task_id.as_str()))
    }

    async fn load_executor(&self, framework_id: &FrameworkId, dir: &Path) -> Result<Option<RecoveredExecutor>, CoreError> {
        let info: ExecutorInfo = match read_json(&dir.join(EXECUTOR_FILE)).await? {
            Some(info) => info,
            None => return Ok(None),
        };
        let container_id: ContainerId = match read_json(&dir.join(LATEST_RUN_FILE)).await? {
            Some(id) => id,
            None => {
                warn!(executor = %info.executor_id, "executor without a recorded run; skipping");
                return Ok(None);
            }
        };
        self.remember_run(framework_id, &info.executor_id, container_id.clone())?;

        let tasks_dir = self
            .run_dir(framework_id, &info.executor_id, &container_id)
            .join("tasks");
        let mut tasks = Vec::new();
        for task_dir in list_dirs(&tasks_dir).await? {
            let Some(task_info) = read_json::<TaskInfo>(&task_dir.join(TASK_FILE)).await? else {
                continue;
            };
            let mut task = RecoveredTask::new(task_info);
            for record in read_records(&task_dir.join(UPDATES_FILE)).await? {
                task.apply(record);
            }
            tasks.push(task);
        }

        Ok(Some(RecoveredExecutor {
            info,
            container_id,
            tasks,
        }))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn checkpoint_agent(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        write_json(&self.root.join(AGENT_FILE), agent_id).await
    }

    async fn checkpoint_framework(&self, framework: &FrameworkInfo) -> Result<(), CoreError> {
        write_json(&self.framework_dir(&framework.id).join(FRAMEWORK_FILE), framework).await
    }

    async fn checkpoint_executor(
        &self,
        framework_id: &FrameworkId,
        executor: &ExecutorInfo,
        container_id: &ContainerId,
    ) -> Result<(), CoreError> {
        let dir = self.executor_dir(framework_id, &executor.executor_id);
        write_json(&dir.join(EXECUTOR_FILE), executor).await?;
        tokio::fs::create_dir_all(self.run_dir(framework_id, &executor.executor_id, container_id)).await?;
        write_json(&dir.join(LATEST_RUN_FILE), container_id).await?;
        self.remember_run(framework_id, &executor.executor_id, container_id.clone())
    }

    async fn checkpoint_task(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task: &TaskInfo,
    ) -> Result<(), CoreError> {
        let dir = self.task_dir(framework_id, executor_id, &task.task_id)?;
        write_json(&dir.join(TASK_FILE), task).await
    }

    async fn append_update(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        task_id: &TaskId,
        record: UpdateRecord,
    ) -> Result<(), CoreError> {
        let path = self.task_dir(framework_id, executor_id, task_id)?.join(UPDATES_FILE);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn remove_executor(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Result<(), CoreError> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&(framework_id.clone(), executor_id.clone()));
        }
        remove_dir(&self.executor_dir(framework_id, executor_id)).await
    }

    async fn remove_framework(&self, framework_id: &FrameworkId) -> Result<(), CoreError> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.retain(|(fid, _), _| fid != framework_id);
        }
        remove_dir(&self.framework_dir(framework_id)).await
    }

    async fn load(&self) -> Result<RecoveredState, CoreError> {
        let agent_id = read_json::<AgentId>(&self.root.join(AGENT_FILE)).await?;

        let mut frameworks = Vec::new();
        for framework_dir in list_dirs(&self.root.join("frameworks")).await? {
            let Some(info) = read_json::<FrameworkInfo>(&framework_dir.join(FRAMEWORK_FILE)).await? else {
                continue;
            };
            let mut executors = Vec::new();
            for executor_dir in list_dirs(&framework_dir.join("executors")).await? {
                if let Some(executor) = self.load_executor(&info.id, &executor_dir).await? {
                    executors.push(executor);
                }
            }
            debug!(framework = %info.id, executors = executors.len(), "recovered framework");
            frameworks.push(RecoveredFramework { info, executors });
        }

        Ok(RecoveredState { agent_id, frameworks })
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads an update log. A torn last line (crash mid-append) is dropped.
async fn read_records(path: &Path) -> Result<Vec<UpdateRecord>, CoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable update record");
            }
        }
    }
    Ok(records)
}

async fn list_dirs(path: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn remove_dir(path: &Path) -> Result<(), CoreError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_model::{CommandInfo, Resources, Source, TaskStatus};

    fn framework() -> FrameworkInfo {
        FrameworkInfo::new("fw", "test").checkpointing()
    }

    fn task() -> TaskInfo {
        TaskInfo::command("t1", CommandInfo::shell("sleep 1"), Resources::new())
    }

    fn update(state: TaskState) -> StatusUpdate {
        StatusUpdate::new(
            FrameworkId::from("fw"),
            Some(ExecutorId::from("t1")),
            TaskStatus::new(TaskId::from("t1"), state, Source::Executor),
        )
    }

    async fn populate(store: &dyn StateStore) -> (StatusUpdate, StatusUpdate) {
        let fw = framework();
        let task = task();
        let executor = ExecutorInfo::for_command_task(&task);
        let container = ContainerId::new("c1");

        store.checkpoint_agent(&AgentId::from("agent-1")).await.unwrap();
        store.checkpoint_framework(&fw).await.unwrap();
        store.checkpoint_executor(&fw.id, &executor, &container).await.unwrap();
        store.checkpoint_task(&fw.id, &executor.executor_id, &task).await.unwrap();

        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        for record in [
            UpdateRecord::Update { update: running.clone() },
            UpdateRecord::Ack { uuid: running.uuid },
            UpdateRecord::Update { update: finished.clone() },
        ] {
            store
                .append_update(&fw.id, &executor.executor_id, &task.task_id, record)
                .await
                .unwrap();
        }
        (running, finished)
    }

    fn assert_recovered(state: &RecoveredState, running: &StatusUpdate, finished: &StatusUpdate) {
        assert_eq!(state.agent_id, Some(AgentId::from("agent-1")));
        assert_eq!(state.frameworks.len(), 1);
        let executor = &state.frameworks[0].executors[0];
        assert_eq!(executor.container_id, ContainerId::new("c1"));

        let task = &executor.tasks[0];
        assert_eq!(task.pending(), vec![finished.clone()]);
        assert_eq!(task.last_acknowledged(), Some(running));
        assert_eq!(task.latest_state(), TaskState::Finished);
        assert!(!task.is_complete());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStateStore::new();
        let (running, finished) = populate(&store).await;
        assert_recovered(&store.load().await.unwrap(), &running, &finished);

        store.remove_framework(&FrameworkId::from("fw")).await.unwrap();
        assert!(store.load().await.unwrap().frameworks.is_empty());
    }

    #[tokio::test]
    async fn file_store_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (running, finished) = populate(&FileStateStore::new(dir.path())).await;

        let reopened = FileStateStore::new(dir.path());
        let state = reopened.load().await.unwrap();
        assert_recovered(&state, &running, &finished);

        // Appends work after a reload without a fresh checkpoint.
        reopened
            .append_update(
                &FrameworkId::from("fw"),
                &ExecutorId::from("t1"),
                &TaskId::from("t1"),
                UpdateRecord::Ack { uuid: finished.uuid },
            )
            .await
            .unwrap();
        let state = reopened.load().await.unwrap();
        assert!(state.frameworks[0].executors[0].tasks[0].is_complete());
    }

    #[tokio::test]
    async fn file_store_uses_nested_run_paths() {
        let dir = tempfile::tempdir().unwrap();
        populate(&FileStateStore::new(dir.path())).await;

        let task_file = dir
            .path()
            .join("frameworks/fw/executors/t1/runs/containers/c1/tasks/t1/task.json");
        assert!(task_file.exists());
    }

    #[tokio::test]
    async fn torn_update_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let (running, _) = populate(&store).await;

        let log = dir
            .path()
            .join("frameworks/fw/executors/t1/runs/containers/c1/tasks/t1/updates.jsonl");
        let mut text = std::fs::read_to_string(&log).unwrap();
        text.push_str("{\"kind\":\"upd");
        std::fs::write(&log, text).unwrap();

        let state = FileStateStore::new(dir.path()).load().await.unwrap();
        let task = &state.frameworks[0].executors[0].tasks[0];
        assert_eq!(task.updates.len(), 2);
        assert_eq!(task.last_acknowledged(), Some(&running));
    }
}
