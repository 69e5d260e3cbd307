use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use taskvisor::{Subscribe, Supervisor, SupervisorConfig};
use berth_api::HttpApi;
use berth_core::agent::{AgentBuilder, mailbox};
use berth_core::collab::{Containerizer, FileStateStore, LoggingControllerLink, StandaloneDetector};
use berth_exec::ProcessContainerizer;
use berth_model::Endpoint;
use berth_observe::{Subscriber, init_logger};
use berth_prometheus::PrometheusMetrics;

mod config;
mod secret;
mod tasks;

use config::DaemonConfig;
use secret::RandomTokens;

/// Node agent: runs executors and tasks on behalf of a cluster controller.
#[derive(Debug, Parser)]
#[command(name = "berth-agentd", version)]
struct Cli {
    /// JSON config file. Defaults apply when omitted.
    #[arg(long, short, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;

    // 1) logger
    init_logger(&config.logger)?;
    info!(version = env!("CARGO_PKG_VERSION"), "logger initialized");

    // 2) metrics
    let metrics = PrometheusMetrics::new().context("creating metrics registry")?;

    // 3) containerizer + agent
    let (handle, mailbox) = mailbox();
    let launcher = config.containerizer.launcher.build(config.agent.runtime_dir.clone());
    let containerizer: Arc<dyn Containerizer> = Arc::new(ProcessContainerizer::new(
        launcher,
        handle.clone(),
        config.containerizer.clone(),
    ));
    let detector = Arc::new(StandaloneDetector::new(config.controller.as_deref().map(Endpoint::from)));
    if config.controller.is_none() {
        info!("no controller configured; waiting for a leader");
    }

    let mut builder = AgentBuilder::new(
        config.agent.clone(),
        Arc::clone(&containerizer),
        Arc::new(LoggingControllerLink),
        detector,
    )
    .with_metrics(Arc::new(metrics.clone()));
    if config.recover {
        info!(dir = %config.meta_dir().display(), "checkpointing enabled");
        builder = builder.with_state_store(Arc::new(FileStateStore::new(config.meta_dir())));
    }
    if config.executor_tokens {
        builder = builder.with_secret_generator(Arc::new(RandomTokens));
    }
    let agent = builder.build(mailbox)?;

    // 4) http
    let listener = TcpListener::bind(&config.http.listen)
        .await
        .with_context(|| format!("binding {}", config.http.listen))?;
    let router = HttpApi::new(handle, containerizer, config.flags())
        .with_metrics(metrics)
        .with_config(&config.http)
        .router();

    // 5) supervisor
    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(Subscriber)];
    let supervisor = Supervisor::builder(SupervisorConfig::default())
        .with_subscribers(subscribers)
        .build();

    let stop = CancellationToken::new();
    supervisor
        .run(vec![
            tasks::agent(agent, stop.clone()),
            tasks::http(listener, router, stop),
        ])
        .await
        .map_err(|e| anyhow!("supervisor exited with error: {e}"))?;

    info!("berth-agentd stopped");
    Ok(())
}
