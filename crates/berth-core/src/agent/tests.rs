use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use berth_model::message::{AgentMessage, ControllerMessage, ExecutorCommand, ExecutorMessage};
use berth_model::{
    AgentId, CommandInfo, ContainerId, Endpoint, ExecutorId, ExecutorInfo, ExecutorKind, FrameworkId, FrameworkInfo,
    ProviderState, Reason, Resource, ResourceProviderId, ResourceVersion, ResourceVersionEntry, Resources, Source,
    StatusUpdate, TaskId, TaskInfo, TaskState, TaskStatus, UpdateUuid,
};

use super::{AgentBuilder, AgentHandle, AgentSnapshot, mailbox};
use crate::collab::{
    AUTHENTICATION_TOKEN_ENV, ChannelControllerLink, ChannelExecutorLink, ContainerConfig, ExecutorLinkRef,
    RecoveredExecutor, RecoveredFramework, RecoveredState, RecoveredTask, Secret, StandaloneDetector, UpdateRecord,
};
use crate::config::AgentConfig;
use crate::testkit::{MockContainerizer, StaticSecretGenerator};

const AGENT: &str = "agent-1";
const LEADER: &str = "controller@10.0.0.1:5050";

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(3600), fut)
        .await
        .expect("timed out")
}

async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..10_000 {
        if let Some(v) = check() {
            return v;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

fn config() -> AgentConfig {
    AgentConfig {
        resources: "cpus:4;mem:4096".into(),
        work_dir: PathBuf::from("/tmp/berth-agent-test"),
        ..AgentConfig::default()
    }
}

fn framework() -> FrameworkInfo {
    FrameworkInfo::new("fw", "test")
}

fn command_task(id: &str) -> TaskInfo {
    TaskInfo::command(id, CommandInfo::shell("sleep 1000"), "cpus:1;mem:128".parse().unwrap())
}

fn custom_executor(id: &str) -> ExecutorInfo {
    ExecutorInfo::custom(id, CommandInfo::shell("./executor"), "cpus:0.1;mem:32".parse().unwrap())
}

fn run_task(framework: FrameworkInfo, task: TaskInfo) -> ControllerMessage {
    ControllerMessage::RunTask {
        framework,
        task,
        resource_versions: Vec::new(),
    }
}

struct Harness {
    handle: AgentHandle,
    controller: mpsc::UnboundedReceiver<(Endpoint, AgentMessage)>,
    containerizer: Arc<MockContainerizer>,
    detector: Arc<StandaloneDetector>,
    leader: Endpoint,
    _cancel: tokio_util::sync::DropGuard,
}

impl Harness {
    fn start(config: AgentConfig) -> Self {
        Self::start_on(MockContainerizer::new(), config, |b| b)
    }

    fn start_with(config: AgentConfig, customize: impl FnOnce(AgentBuilder) -> AgentBuilder) -> Self {
        Self::start_on(MockContainerizer::new(), config, customize)
    }

    fn start_on(
        containerizer: Arc<MockContainerizer>,
        config: AgentConfig,
        customize: impl FnOnce(AgentBuilder) -> AgentBuilder,
    ) -> Self {
        let (handle, mailbox) = mailbox();
        let (link, controller) = ChannelControllerLink::new();
        let leader = Endpoint::from(LEADER);
        let detector = Arc::new(StandaloneDetector::new(Some(leader.clone())));

        let builder = AgentBuilder::new(config, containerizer.clone(), link, detector.clone());
        let agent = customize(builder).build(mailbox).unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(agent.run(cancel.clone()));

        Self {
            handle,
            controller,
            containerizer,
            detector,
            leader,
            _cancel: cancel.drop_guard(),
        }
    }

    fn send(&self, message: ControllerMessage) {
        self.handle
            .controller_message(self.leader.clone(), message)
            .unwrap();
    }

    async fn next_message(&mut self) -> AgentMessage {
        within(self.controller.recv()).await.expect("controller link closed").1
    }

    /// Next message of `kind` and where it went, skipping everything else.
    async fn next_envelope(&mut self, kind: &str) -> (Endpoint, AgentMessage) {
        loop {
            let (to, message) = within(self.controller.recv()).await.expect("controller link closed");
            if message.kind() == kind {
                return (to, message);
            }
        }
    }

    async fn next_kind(&mut self, kind: &str) -> AgentMessage {
        self.next_envelope(kind).await.1
    }

    async fn next_update(&mut self) -> StatusUpdate {
        match self.next_kind("status_update").await {
            AgentMessage::StatusUpdate { update } => update,
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn register(&mut self) {
        self.next_kind("register").await;
        self.send(ControllerMessage::Registered {
            agent_id: AgentId::from(AGENT),
            ping_timeout_ms: None,
        });
        self.next_kind("update_agent").await;
    }

    fn ack(&self, update: &StatusUpdate) {
        self.send(ControllerMessage::StatusUpdateAcknowledgement {
            framework_id: update.framework_id.clone(),
            task_id: update.task_id().clone(),
            uuid: update.uuid,
        });
    }

    async fn launched(&self, n: usize) -> (ContainerId, ContainerConfig) {
        let mock = self.containerizer.clone();
        eventually(|| mock.launched().get(n).cloned()).await
    }

    async fn destroyed(&self, container_id: &ContainerId) {
        let mock = self.containerizer.clone();
        eventually(|| mock.destroyed().contains(container_id).then_some(())).await
    }

    async fn snapshot(&self) -> AgentSnapshot {
        self.handle.snapshot().await.unwrap()
    }

    fn connect(&self, framework: &str, executor: &str) -> ExecutorEnd {
        self.connect_with(framework, executor, ExecutorMessage::Register)
    }

    fn connect_with(&self, framework: &str, executor: &str, hello: ExecutorMessage) -> ExecutorEnd {
        let (link, rx) = ChannelExecutorLink::new();
        let end = ExecutorEnd {
            handle: self.handle.clone(),
            framework_id: FrameworkId::from(framework),
            executor_id: ExecutorId::from(executor),
            link,
            rx,
        };
        end.send(hello);
        end
    }
}

struct ExecutorEnd {
    handle: AgentHandle,
    framework_id: FrameworkId,
    executor_id: ExecutorId,
    link: ExecutorLinkRef,
    rx: mpsc::UnboundedReceiver<ExecutorCommand>,
}

impl ExecutorEnd {
    fn send(&self, message: ExecutorMessage) {
        self.handle
            .executor_message(
                self.framework_id.clone(),
                self.executor_id.clone(),
                message,
                Some(self.link.clone()),
            )
            .unwrap();
    }

    fn status(&self, task: &str, state: TaskState) -> UpdateUuid {
        let uuid = UpdateUuid::random();
        let status = TaskStatus::new(TaskId::from(task), state, Source::Executor).with_uuid(uuid);
        self.send(ExecutorMessage::StatusUpdate { status });
        uuid
    }

    async fn next_command(&mut self) -> ExecutorCommand {
        within(self.rx.recv()).await.expect("executor link closed")
    }

    /// Registers and waits for the first launch to arrive.
    async fn expect_launch(&mut self) -> Vec<TaskId> {
        assert!(matches!(self.next_command().await, ExecutorCommand::Registered { .. }));
        match self.next_command().await {
            ExecutorCommand::RunTask { task, .. } => vec![task.task_id],
            ExecutorCommand::RunTaskGroup { tasks, .. } => tasks.into_iter().map(|t| t.task_id).collect(),
            other => panic!("unexpected command {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn registers_with_advertised_resources() {
    let mut h = Harness::start(config());

    match h.next_kind("register").await {
        AgentMessage::Register {
            resources,
            resource_versions,
        } => {
            assert_eq!(resources.get("cpus"), 4.0);
            assert_eq!(resource_versions.len(), 1);
            assert_eq!(resource_versions[0].provider, None);
        }
        other => panic!("unexpected message {other:?}"),
    }
    h.send(ControllerMessage::Registered {
        agent_id: AgentId::from(AGENT),
        ping_timeout_ms: None,
    });
    h.next_kind("update_agent").await;

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.agent_id, Some(AgentId::from(AGENT)));
    assert_eq!(snapshot.state, super::AgentState::Running);
    assert_eq!(snapshot.leader, Some(h.leader.clone()));
}

#[tokio::test(start_paused = true)]
async fn task_runs_to_completion_and_is_purged() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));

    let (container_id, launched) = h.launched(0).await;
    assert_eq!(launched.executor.executor_id, ExecutorId::from("t1"));
    assert_eq!(launched.executor.kind, ExecutorKind::Command);
    assert_eq!(launched.agent_id, Some(AgentId::from(AGENT)));
    assert!(launched.sandbox.ends_with(format!("runs/containers/{}", container_id.value())));

    let mut exec = h.connect("fw", "t1");
    assert_eq!(exec.expect_launch().await, vec![TaskId::from("t1")]);

    let running = exec.status("t1", TaskState::Running);
    assert_eq!(
        exec.next_command().await,
        ExecutorCommand::Acknowledged {
            task_id: TaskId::from("t1"),
            uuid: running
        }
    );
    let update = h.next_update().await;
    assert_eq!(update.uuid, running);
    assert_eq!(update.state(), TaskState::Running);
    assert_eq!(update.agent_id, Some(AgentId::from(AGENT)));
    h.ack(&update);

    let finished = exec.status("t1", TaskState::Finished);
    exec.next_command().await;
    let update = h.next_update().await;
    assert_eq!(update.uuid, finished);
    h.ack(&update);

    h.containerizer.exit(&container_id, 0);
    assert_eq!(
        h.next_kind("exited_executor").await,
        AgentMessage::ExitedExecutor {
            agent_id: Some(AgentId::from(AGENT)),
            framework_id: FrameworkId::from("fw"),
            executor_id: ExecutorId::from("t1"),
            status: Some(0),
        }
    );

    let snapshot = h.snapshot().await;
    assert!(snapshot.frameworks.is_empty());
    assert_eq!(snapshot.completed_frameworks.len(), 1);
    let executor = &snapshot.completed_frameworks[0].completed_executors[0];
    assert_eq!(executor.completed_tasks[0].state, TaskState::Finished);
}

#[tokio::test(start_paused = true)]
async fn launches_are_dropped_until_registered() {
    let h = Harness::start(config());
    h.send(run_task(framework(), command_task("t1")));

    let snapshot = h.snapshot().await;
    assert!(snapshot.frameworks.is_empty());
    assert!(h.containerizer.launched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn messages_from_other_controllers_are_ignored() {
    let mut h = Harness::start(config());
    h.register().await;

    h.handle
        .controller_message(
            Endpoint::from("controller@10.0.0.2:5050"),
            run_task(framework(), command_task("t1")),
        )
        .unwrap();

    let snapshot = h.snapshot().await;
    assert!(snapshot.frameworks.is_empty());
    assert!(h.containerizer.launched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn kill_before_executor_registers_reports_killed() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    let (container_id, _) = h.launched(0).await;

    h.send(ControllerMessage::KillTask {
        framework_id: FrameworkId::from("fw"),
        task_id: TaskId::from("t1"),
    });

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Killed);
    assert_eq!(update.status.reason, Some(Reason::TaskKilledDuringLaunch));
    assert_eq!(update.status.source, Source::Agent);

    // The executor never received a task, so it is torn down right away.
    h.destroyed(&container_id).await;
}

#[tokio::test(start_paused = true)]
async fn kill_of_running_task_goes_to_the_executor_once() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    let kill = ControllerMessage::KillTask {
        framework_id: FrameworkId::from("fw"),
        task_id: TaskId::from("t1"),
    };
    h.send(kill.clone());
    h.send(kill);
    assert_eq!(
        exec.next_command().await,
        ExecutorCommand::KillTask {
            task_id: TaskId::from("t1"),
            kill_policy: None
        }
    );

    h.snapshot().await;
    assert!(exec.rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn registration_timeout_fails_queued_tasks() {
    let mut h = Harness::start(AgentConfig {
        executor_registration_timeout_ms: 5_000,
        ..config()
    });
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    let (container_id, _) = h.launched(0).await;

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Failed);
    assert_eq!(update.status.reason, Some(Reason::ExecutorRegistrationTimeout));
    assert!(h.containerizer.destroyed().contains(&container_id));
}

async fn failed_update_outcome(framework: FrameworkInfo) -> StatusUpdate {
    let mut h = Harness::start(config());
    h.containerizer.fail_updates("cgroup is gone");
    h.register().await;
    h.send(run_task(framework, command_task("t1")));
    h.launched(0).await;

    let mut exec = h.connect("fw", "t1");
    assert!(matches!(exec.next_command().await, ExecutorCommand::Registered { .. }));
    h.next_update().await
}

#[tokio::test(start_paused = true)]
async fn failed_container_update_reports_collateral_state() {
    let update = failed_update_outcome(framework()).await;
    assert_eq!(update.state(), TaskState::Lost);
    assert_eq!(update.status.reason, Some(Reason::ContainerUpdateFailed));

    let update = failed_update_outcome(framework().partition_aware()).await;
    assert_eq!(update.state(), TaskState::Gone);
    assert_eq!(update.status.reason, Some(Reason::ContainerUpdateFailed));
}

#[tokio::test(start_paused = true)]
async fn failed_launch_fails_tasks() {
    let mut h = Harness::start(config());
    h.containerizer.fail_launches("no space left on device");
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Failed);
    assert_eq!(update.status.reason, Some(Reason::ContainerLaunchFailed));
    assert!(update.status.message.unwrap_or_default().contains("no space left"));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_update_is_resent_with_the_same_uuid() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    let running = exec.status("t1", TaskState::Running);
    let first = h.next_update().await;
    let start = Instant::now();
    let second = h.next_update().await;

    assert_eq!(first.uuid, running);
    assert_eq!(second.uuid, running);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11), "resent after {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn repeated_terminal_update_is_acknowledged_but_not_forwarded() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    exec.status("t1", TaskState::Finished);
    exec.next_command().await;
    let finished = h.next_update().await;

    let again = exec.status("t1", TaskState::Finished);
    assert_eq!(
        exec.next_command().await,
        ExecutorCommand::Acknowledged {
            task_id: TaskId::from("t1"),
            uuid: again
        }
    );
    h.ack(&finished);

    tokio::time::sleep(Duration::from_secs(120)).await;
    while let Ok((_, message)) = h.controller.try_recv() {
        assert!(!matches!(message, AgentMessage::StatusUpdate { .. }), "unexpected {message:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn stale_provider_version_drops_the_launch() {
    let mut h = Harness::start(config());
    h.register().await;

    let provider = ResourceProviderId::from("rp-1");
    h.handle
        .update_resource_provider(ProviderState {
            provider: provider.clone(),
            version: ResourceVersion::random(),
            total: Resources::new(),
        })
        .unwrap();
    h.next_kind("update_agent").await;

    let mut task = command_task("t1");
    task.resources
        .push(Resource::scalar("disk", 10.0).with_provider(provider.clone()));
    h.send(ControllerMessage::RunTask {
        framework: framework(),
        task,
        resource_versions: vec![ResourceVersionEntry {
            provider: Some(provider),
            version: ResourceVersion::random(),
        }],
    });

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Lost);
    assert_eq!(update.status.reason, Some(Reason::InvalidOffers));
    assert!(h.containerizer.launched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reference_secret_fails_the_launch() {
    let mut h = Harness::start_with(config(), |b| {
        b.with_secret_generator(StaticSecretGenerator::returning(Secret::Reference {
            name: "vault".into(),
            key: None,
        }))
    });
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));

    match h.next_kind("exited_executor").await {
        AgentMessage::ExitedExecutor { executor_id, .. } => assert_eq!(executor_id, ExecutorId::from("t1")),
        other => panic!("unexpected message {other:?}"),
    }
    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Failed);
    assert_eq!(update.status.reason, Some(Reason::ContainerLaunchFailed));
    assert!(update.status.message.unwrap_or_default().contains("REFERENCE"));
    assert!(h.containerizer.launched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn generated_secret_reaches_the_executor_environment() {
    let mut h = Harness::start_with(config(), |b| b.with_secret_generator(StaticSecretGenerator::value("s3cr3t")));
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));

    let (_, launched) = h.launched(0).await;
    assert_eq!(launched.env.get(AUTHENTICATION_TOKEN_ENV), Some("s3cr3t"));
}

#[tokio::test(start_paused = true)]
async fn executor_grace_period_overrides_the_default() {
    let mut h = Harness::start(config());
    h.register().await;
    let executor = custom_executor("ex").with_shutdown_grace_period(Duration::from_secs(2));
    h.send(ControllerMessage::RunTaskGroup {
        framework: framework(),
        executor,
        tasks: vec![command_task("a"), command_task("b")],
        resource_versions: Vec::new(),
    });
    let (container_id, _) = h.launched(0).await;
    let mut exec = h.connect("fw", "ex");
    assert_eq!(exec.expect_launch().await, vec![TaskId::from("a"), TaskId::from("b")]);

    h.send(ControllerMessage::ShutdownExecutor {
        framework_id: FrameworkId::from("fw"),
        executor_id: ExecutorId::from("ex"),
    });
    assert_eq!(exec.next_command().await, ExecutorCommand::Shutdown);

    let start = Instant::now();
    h.destroyed(&container_id).await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(2), "destroyed after {waited:?}");
    assert!(waited < Duration::from_secs(5), "destroyed after {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn silent_controller_triggers_one_reregistration() {
    let mut h = Harness::start(AgentConfig {
        ping_timeout_ms: 1_000,
        max_ping_timeouts: 3,
        ..config()
    });
    h.register().await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.send(ControllerMessage::Ping { connected: true });
        assert_eq!(h.next_message().await, AgentMessage::Pong);
    }

    let start = Instant::now();
    match h.next_message().await {
        AgentMessage::Reregister { agent_id, .. } => assert_eq!(agent_id, AgentId::from(AGENT)),
        other => panic!("unexpected message {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn new_leader_gets_the_reregistration() {
    let mut h = Harness::start(config());
    h.register().await;

    let next = Endpoint::from("controller@10.0.0.2:5050");
    h.detector.appoint(Some(next.clone()));

    let (to, message) = h.next_envelope("reregister").await;
    assert_eq!(to, next);
    assert!(matches!(message, AgentMessage::Reregister { .. }));
}

#[tokio::test(start_paused = true)]
async fn reregistration_reports_update_markers() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    let running = exec.status("t1", TaskState::Running);
    exec.next_command().await;
    assert_eq!(h.next_update().await.uuid, running);
    exec.status("t1", TaskState::Finished);
    exec.next_command().await;

    h.send(ControllerMessage::Ping { connected: false });
    match h.next_kind("reregister").await {
        AgentMessage::Reregister {
            frameworks,
            executors,
            tasks,
            ..
        } => {
            assert_eq!(frameworks.len(), 1);
            assert_eq!(executors.len(), 1);
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].state, TaskState::Finished);
            assert_eq!(tasks[0].status_update_state, Some(TaskState::Running));
            assert_eq!(tasks[0].status_update_uuid, Some(running));
        }
        other => panic!("unexpected message {other:?}"),
    }

    h.send(ControllerMessage::Reregistered {
        agent_id: AgentId::from(AGENT),
        ping_timeout_ms: None,
    });
    let resent = h.next_update().await;
    assert_eq!(resent.uuid, running);
    assert_eq!(resent.latest_state, Some(TaskState::Finished));
}

#[tokio::test(start_paused = true)]
async fn shutdown_framework_removes_it_once_executors_exit() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    let (container_id, _) = h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    h.send(ControllerMessage::ShutdownFramework {
        framework_id: FrameworkId::from("fw"),
    });
    assert_eq!(exec.next_command().await, ExecutorCommand::Shutdown);

    h.containerizer.exit(&container_id, 0);
    h.next_kind("exited_executor").await;

    let snapshot = h.snapshot().await;
    assert!(snapshot.frameworks.is_empty());
    assert_eq!(snapshot.completed_frameworks[0].id, FrameworkId::from("fw"));
}

fn recovered_state(container_id: &ContainerId) -> (RecoveredState, StatusUpdate) {
    let framework = framework().checkpointing();
    let task = command_task("t1");
    let running = StatusUpdate::new(
        framework.id.clone(),
        Some(ExecutorId::from("ex")),
        TaskStatus::new(TaskId::from("t1"), TaskState::Running, Source::Executor),
    );
    let mut recovered = RecoveredTask::new(task);
    recovered.apply(UpdateRecord::Update {
        update: running.clone(),
    });

    let state = RecoveredState {
        agent_id: Some(AgentId::from(AGENT)),
        frameworks: vec![RecoveredFramework {
            info: framework,
            executors: vec![RecoveredExecutor {
                info: custom_executor("ex"),
                container_id: container_id.clone(),
                tasks: vec![recovered],
            }],
        }],
    };
    (state, running)
}

#[tokio::test(start_paused = true)]
async fn recovered_executor_reregisters_and_pending_update_is_resent() {
    let mock = MockContainerizer::new();
    let container_id = ContainerId::new("run-1");
    let stray = ContainerId::new("stray");
    mock.adopt(container_id.clone());
    mock.adopt(stray.clone());
    let (state, running) = recovered_state(&container_id);

    let mut h = Harness::start_on(mock, config(), |b| b.with_recovered_state(state));
    let mut exec = h.connect_with(
        "fw",
        "ex",
        ExecutorMessage::Reregister {
            tasks: vec![command_task("t1")],
            updates: Vec::new(),
        },
    );
    assert_eq!(
        exec.next_command().await,
        ExecutorCommand::Reregistered {
            agent_id: Some(AgentId::from(AGENT))
        }
    );
    h.destroyed(&stray).await;

    match h.next_kind("reregister").await {
        AgentMessage::Reregister { tasks, .. } => {
            assert_eq!(tasks[0].status_update_uuid, Some(running.uuid));
        }
        other => panic!("unexpected message {other:?}"),
    }
    h.send(ControllerMessage::Reregistered {
        agent_id: AgentId::from(AGENT),
        ping_timeout_ms: None,
    });
    assert_eq!(h.next_update().await.uuid, running.uuid);
    assert!(h.containerizer.is_live(&container_id));
}

#[tokio::test(start_paused = true)]
async fn silent_recovered_executor_is_destroyed_and_its_tasks_lost() {
    let mock = MockContainerizer::new();
    let container_id = ContainerId::new("run-1");
    mock.adopt(container_id.clone());
    let (state, running) = recovered_state(&container_id);

    let mut h = Harness::start_on(mock, config(), |b| b.with_recovered_state(state));
    h.next_kind("reregister").await;
    h.destroyed(&container_id).await;

    h.send(ControllerMessage::Reregistered {
        agent_id: AgentId::from(AGENT),
        ping_timeout_ms: None,
    });
    let first = h.next_update().await;
    assert_eq!(first.uuid, running.uuid);
    h.ack(&first);

    let lost = h.next_update().await;
    assert_eq!(lost.state(), TaskState::Lost);
    assert_eq!(lost.status.reason, Some(Reason::ExecutorReregistrationTimeout));
}

#[tokio::test(start_paused = true)]
async fn kill_during_a_slow_launch_destroys_the_late_container() {
    let mock = MockContainerizer::new();
    mock.delay_launches(Duration::from_secs(1));
    let mut h = Harness::start_on(mock, config(), |b| b);
    h.register().await;
    h.send(run_task(framework(), command_task("t1").with_executor(custom_executor("ex"))));
    h.send(ControllerMessage::KillTask {
        framework_id: FrameworkId::from("fw"),
        task_id: TaskId::from("t1"),
    });

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Killed);
    assert_eq!(update.status.reason, Some(Reason::TaskKilledDuringLaunch));
    h.ack(&update);

    let (container_id, _) = h.launched(0).await;
    h.destroyed(&container_id).await;
    match h.next_kind("exited_executor").await {
        AgentMessage::ExitedExecutor { executor_id, .. } => assert_eq!(executor_id, ExecutorId::from("ex")),
        other => panic!("unexpected message {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!h.containerizer.is_live(&container_id));
    let snapshot = h.snapshot().await;
    assert!(snapshot.frameworks.is_empty());
    assert_eq!(snapshot.completed_frameworks[0].id, FrameworkId::from("fw"));
}

#[tokio::test(start_paused = true)]
async fn registration_timeout_during_a_slow_launch_fails_queued_tasks() {
    let mock = MockContainerizer::new();
    mock.delay_launches(Duration::from_secs(10));
    let mut h = Harness::start_on(
        mock,
        AgentConfig {
            executor_registration_timeout_ms: 5_000,
            ..config()
        },
        |b| b,
    );
    h.register().await;
    let start = Instant::now();
    h.send(run_task(framework(), command_task("t1")));

    let update = h.next_update().await;
    assert_eq!(update.state(), TaskState::Failed);
    assert_eq!(update.status.reason, Some(Reason::ExecutorRegistrationTimeout));
    assert!(start.elapsed() >= Duration::from_secs(10), "failed after {:?}", start.elapsed());

    let (container_id, _) = h.launched(0).await;
    h.destroyed(&container_id).await;
    assert!(!h.containerizer.is_live(&container_id));
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_from_another_controller_leaves_the_update_pending() {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework(), command_task("t1")));
    h.launched(0).await;
    let mut exec = h.connect("fw", "t1");
    exec.expect_launch().await;

    exec.status("t1", TaskState::Running);
    let first = h.next_update().await;
    let start = Instant::now();
    h.handle
        .controller_message(
            Endpoint::from("controller@10.0.0.9:5050"),
            ControllerMessage::StatusUpdateAcknowledgement {
                framework_id: first.framework_id.clone(),
                task_id: first.task_id().clone(),
                uuid: first.uuid,
            },
        )
        .unwrap();

    let resent = h.next_update().await;
    assert_eq!(resent.uuid, first.uuid);
    assert!(start.elapsed() >= Duration::from_secs(9), "resent after {:?}", start.elapsed());

    h.ack(&resent);
    tokio::time::sleep(Duration::from_secs(120)).await;
    while let Ok((_, message)) = h.controller.try_recv() {
        assert!(!matches!(message, AgentMessage::StatusUpdate { .. }), "unexpected {message:?}");
    }
}

/// Runs tasks "a" and "b" on one executor, kills "a" and lets the release of
/// its resources fail. Returns the updates for "a" and "b".
async fn kill_with_failing_release(framework: FrameworkInfo) -> (StatusUpdate, StatusUpdate) {
    let mut h = Harness::start(config());
    h.register().await;
    h.send(run_task(framework.clone(), command_task("a").with_executor(custom_executor("ex"))));
    let (container_id, _) = h.launched(0).await;
    let mut exec = h.connect("fw", "ex");
    assert_eq!(exec.expect_launch().await, vec![TaskId::from("a")]);

    h.send(run_task(framework, command_task("b").with_executor(custom_executor("ex"))));
    match exec.next_command().await {
        ExecutorCommand::RunTask { task, .. } => assert_eq!(task.task_id, TaskId::from("b")),
        other => panic!("unexpected command {other:?}"),
    }

    h.containerizer.fail_updates("cgroup is gone");
    h.send(ControllerMessage::KillTask {
        framework_id: FrameworkId::from("fw"),
        task_id: TaskId::from("a"),
    });
    assert!(matches!(exec.next_command().await, ExecutorCommand::KillTask { .. }));
    exec.status("a", TaskState::Killed);

    let killed = h.next_update().await;
    h.destroyed(&container_id).await;
    let collateral = h.next_update().await;
    assert_eq!(killed.task_id(), &TaskId::from("a"));
    assert_eq!(collateral.task_id(), &TaskId::from("b"));
    (killed, collateral)
}

#[tokio::test(start_paused = true)]
async fn failed_release_after_a_kill_loses_the_sibling_task() {
    let (killed, collateral) = kill_with_failing_release(framework()).await;
    assert_eq!(killed.state(), TaskState::Killed);
    assert_eq!(killed.status.source, Source::Executor);
    assert_eq!(collateral.state(), TaskState::Lost);
    assert_eq!(collateral.status.reason, Some(Reason::ContainerUpdateFailed));
}

#[tokio::test(start_paused = true)]
async fn failed_release_after_a_kill_reports_gone_to_partition_aware_frameworks() {
    let (killed, collateral) = kill_with_failing_release(framework().partition_aware()).await;
    assert_eq!(killed.state(), TaskState::Killed);
    assert_eq!(killed.status.source, Source::Executor);
    assert_eq!(collateral.state(), TaskState::Gone);
    assert_eq!(collateral.status.reason, Some(Reason::ContainerUpdateFailed));
}

async fn duplicate_reregistration(retry: bool) -> (ExecutorEnd, ExecutorEnd, Harness) {
    let mock = MockContainerizer::new();
    let container_id = ContainerId::new("run-1");
    mock.adopt(container_id.clone());
    let (state, _) = recovered_state(&container_id);
    let config = AgentConfig {
        executor_reregistration_retry: retry,
        ..config()
    };

    let h = Harness::start_on(mock, config, |b| b.with_recovered_state(state));
    let hello = || ExecutorMessage::Reregister {
        tasks: vec![command_task("t1")],
        updates: Vec::new(),
    };
    let mut first = h.connect_with("fw", "ex", hello());
    assert!(matches!(first.next_command().await, ExecutorCommand::Reregistered { .. }));
    let second = h.connect_with("fw", "ex", hello());
    h.snapshot().await;
    (first, second, h)
}

#[tokio::test(start_paused = true)]
async fn duplicate_reregistration_is_ignored_when_retry_is_enabled() {
    let (mut first, mut second, h) = duplicate_reregistration(true).await;

    assert!(second.rx.try_recv().is_err());
    assert!(first.rx.try_recv().is_err());
    assert!(h.containerizer.is_live(&ContainerId::new("run-1")));
    let snapshot = h.snapshot().await;
    let (_, executor) = snapshot.live_executors().next().expect("executor is gone");
    assert_eq!(executor.id, ExecutorId::from("ex"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_reregistration_is_shut_down_when_retry_is_disabled() {
    let (mut first, mut second, h) = duplicate_reregistration(false).await;

    assert_eq!(second.next_command().await, ExecutorCommand::Shutdown);
    assert!(first.rx.try_recv().is_err());
    assert!(h.containerizer.is_live(&ContainerId::new("run-1")));
}
