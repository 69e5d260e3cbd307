use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use berth_core::agent::{AgentHandle, AgentSnapshot};
use berth_core::collab::{ContainerStatus, Containerizer, ResourceStatistics};
use berth_model::{ContainerId, ExecutorId, FrameworkId};
use berth_prometheus::PrometheusMetrics;

use crate::auth::{Authenticator, require_credentials};
use crate::config::HttpConfig;
use crate::error::ApiError;

#[derive(Clone)]
struct ApiState {
    agent: AgentHandle,
    containerizer: Arc<dyn Containerizer>,
    metrics: Option<PrometheusMetrics>,
    flags: Arc<serde_json::Value>,
}

/// Builder for the agent's HTTP router.
pub struct HttpApi {
    state: ApiState,
    auth: Option<Arc<Authenticator>>,
}

impl HttpApi {
    /// `flags` is rendered verbatim by `/flags`.
    pub fn new(agent: AgentHandle, containerizer: Arc<dyn Containerizer>, flags: serde_json::Value) -> Self {
        Self {
            state: ApiState {
                agent,
                containerizer,
                metrics: None,
                flags: Arc::new(flags),
            },
            auth: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    /// Protects every route when `authenticateReadonly` is set; all routes
    /// are read-only.
    pub fn with_config(mut self, config: &HttpConfig) -> Self {
        self.auth = config
            .authenticate_readonly
            .then(|| Arc::new(Authenticator::new(config.credentials.clone())));
        self
    }

    pub fn router(self) -> Router {
        let router = Router::new()
            .route("/state", get(state))
            .route("/flags", get(flags))
            .route("/containers", get(containers))
            .route("/monitor/statistics", get(statistics))
            .route("/monitor/statistics.json", get(statistics))
            .route("/metrics", get(metrics))
            .with_state(self.state);
        match self.auth {
            Some(auth) => router.layer(middleware::from_fn_with_state(auth, require_credentials)),
            None => router,
        }
    }
}

/// Serves `router` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "http api listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerEntry {
    framework_id: FrameworkId,
    executor_id: ExecutorId,
    executor_name: String,
    container_id: ContainerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    statistics: Option<ResourceStatistics>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsEntry {
    framework_id: FrameworkId,
    executor_id: ExecutorId,
    executor_name: String,
    container_id: ContainerId,
    statistics: ResourceStatistics,
}

#[derive(Debug, Default, Deserialize)]
struct ContainersQuery {
    container_id: Option<String>,
}

/// GET /state
async fn state(State(api): State<ApiState>) -> Result<Json<AgentSnapshot>, ApiError> {
    Ok(Json(api.agent.snapshot().await?))
}

/// GET /flags
async fn flags(State(api): State<ApiState>) -> Json<serde_json::Value> {
    Json(api.flags.as_ref().clone())
}

/// GET /containers
async fn containers(
    State(api): State<ApiState>,
    Query(query): Query<ContainersQuery>,
) -> Result<Json<Vec<ContainerEntry>>, ApiError> {
    let filter = match query.container_id.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::InvalidRequest("container_id cannot be empty".into())),
        other => other.map(str::to_string),
    };

    let snapshot = api.agent.snapshot().await?;
    let mut entries = Vec::new();
    for (framework, executor) in snapshot.live_executors() {
        let container_id = &executor.container_id;
        if filter.as_deref().is_some_and(|f| f != container_id.to_string()) {
            continue;
        }
        let status = api.containerizer.status(container_id).await.ok();
        let statistics = match api.containerizer.usage(container_id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!(container = %container_id, error = %e, "usage unavailable");
                None
            }
        };
        entries.push(ContainerEntry {
            framework_id: framework.id.clone(),
            executor_id: executor.id.clone(),
            executor_name: executor.name.clone(),
            container_id: container_id.clone(),
            status,
            statistics,
        });
    }
    Ok(Json(entries))
}

/// GET /monitor/statistics(.json)
///
/// Containers whose usage cannot be read are left out.
async fn statistics(State(api): State<ApiState>) -> Result<Json<Vec<StatisticsEntry>>, ApiError> {
    let snapshot = api.agent.snapshot().await?;
    let mut entries = Vec::new();
    for (framework, executor) in snapshot.live_executors() {
        match api.containerizer.usage(&executor.container_id).await {
            Ok(statistics) => entries.push(StatisticsEntry {
                framework_id: framework.id.clone(),
                executor_id: executor.id.clone(),
                executor_name: executor.name.clone(),
                container_id: executor.container_id.clone(),
                statistics,
            }),
            Err(e) => debug!(container = %executor.container_id, error = %e, "skipping container without usage"),
        }
    }
    Ok(Json(entries))
}

/// GET /metrics
async fn metrics(State(api): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let body = match &api.metrics {
        Some(metrics) => metrics.encode_text().map_err(|e| ApiError::Internal(e.to_string()))?,
        None => String::new(),
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use berth_core::agent::{AgentBuilder, mailbox};
    use berth_core::collab::{ChannelControllerLink, StandaloneDetector};
    use berth_core::config::AgentConfig;
    use berth_core::metrics::MetricsBackend;
    use berth_core::testkit::MockContainerizer;
    use berth_model::message::{AgentMessage, ControllerMessage};
    use berth_model::{AgentId, CommandInfo, Endpoint, ExecutorInfo, FrameworkInfo, TaskInfo};

    use super::*;
    use crate::auth::Credential;

    const LEADER: &str = "controller@10.0.0.1:5050";

    struct Node {
        agent: AgentHandle,
        containerizer: Arc<MockContainerizer>,
        controller: mpsc::UnboundedReceiver<(Endpoint, AgentMessage)>,
        _cancel: tokio_util::sync::DropGuard,
    }

    impl Node {
        async fn start() -> Self {
            let (agent, mailbox) = mailbox();
            let (link, controller) = ChannelControllerLink::new();
            let containerizer = MockContainerizer::new();
            let detector = Arc::new(StandaloneDetector::new(Some(Endpoint::from(LEADER))));
            let config = AgentConfig {
                resources: "cpus:2;mem:1024".into(),
                ..AgentConfig::default()
            };
            let built = AgentBuilder::new(config, containerizer.clone(), link, detector)
                .build(mailbox)
                .unwrap();
            let cancel = CancellationToken::new();
            tokio::spawn(built.run(cancel.clone()));

            let mut node = Self {
                agent,
                containerizer,
                controller,
                _cancel: cancel.drop_guard(),
            };
            node.next_kind("register").await;
            node.send(ControllerMessage::Registered {
                agent_id: AgentId::from("agent-1"),
                ping_timeout_ms: None,
            });
            node.next_kind("update_agent").await;
            node
        }

        fn send(&self, message: ControllerMessage) {
            self.agent.controller_message(Endpoint::from(LEADER), message).unwrap();
        }

        async fn next_kind(&mut self, kind: &str) {
            loop {
                let (_, message) = self.controller.recv().await.expect("controller link closed");
                if message.kind() == kind {
                    return;
                }
            }
        }

        /// Launches one custom executor and returns its container id.
        async fn launch(&self) -> ContainerId {
            let executor = ExecutorInfo::custom("exec", CommandInfo::shell("./executor"), "cpus:0.1;mem:32".parse().unwrap());
            let task = TaskInfo::command("t1", CommandInfo::shell("true"), "cpus:1;mem:128".parse().unwrap())
                .with_executor(executor);
            self.send(ControllerMessage::RunTask {
                framework: FrameworkInfo::new("fw", "test"),
                task,
                resource_versions: Vec::new(),
            });
            loop {
                if let Some((id, _)) = self.containerizer.launched().first() {
                    return id.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        fn api(&self) -> HttpApi {
            HttpApi::new(
                self.agent.clone(),
                self.containerizer.clone(),
                serde_json::json!({ "agent": { "pingTimeoutMs": 15000 } }),
            )
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        get_with(router, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn get_with(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test(start_paused = true)]
    async fn state_reports_registration_and_frameworks() {
        let node = Node::start().await;
        node.launch().await;

        let (status, body) = get(node.api().router(), "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agentId"], "agent-1");
        assert_eq!(body["frameworks"][0]["id"], "fw");
        assert_eq!(body["frameworks"][0]["executors"][0]["id"], "exec");
    }

    #[tokio::test(start_paused = true)]
    async fn flags_are_echoed() {
        let node = Node::start().await;
        let (status, body) = get(node.api().router(), "/flags").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"]["pingTimeoutMs"], 15000);
    }

    #[tokio::test(start_paused = true)]
    async fn containers_can_be_filtered_by_id() {
        let node = Node::start().await;
        let container_id = node.launch().await;

        let (_, all) = get(node.api().router(), "/containers").await;
        assert_eq!(all.as_array().unwrap().len(), 1);
        assert_eq!(all[0]["containerId"]["value"], container_id.value());
        assert_eq!(all[0]["executorId"], "exec");
        assert_eq!(all[0]["statistics"]["processes"], 1);

        let uri = format!("/containers?container_id={container_id}");
        let (_, one) = get(node.api().router(), &uri).await;
        assert_eq!(one.as_array().unwrap().len(), 1);

        let (_, none) = get(node.api().router(), "/containers?container_id=nope").await;
        assert!(none.as_array().unwrap().is_empty());

        let (status, _) = get(node.api().router(), "/containers?container_id=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_are_served_on_both_paths() {
        let node = Node::start().await;
        node.launch().await;

        for uri in ["/monitor/statistics", "/monitor/statistics.json"] {
            let (status, body) = get(node.api().router(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body[0]["executorId"], "exec");
            assert_eq!(body[0]["statistics"]["processes"], 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_are_rendered_as_text() {
        let node = Node::start().await;
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_ping_timeout();

        let response = node
            .api()
            .with_metrics(metrics)
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("berth_ping_timeouts_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn readonly_authentication_guards_every_route() {
        let node = Node::start().await;
        let config = HttpConfig {
            authenticate_readonly: true,
            credentials: vec![Credential {
                principal: "ops".into(),
                secret: "pw".into(),
            }],
            ..HttpConfig::default()
        };

        for uri in ["/state", "/flags", "/containers", "/monitor/statistics", "/metrics"] {
            let response = node
                .api()
                .with_config(&config)
                .router()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic realm=\"berth\"");
        }

        let request = Request::get("/flags")
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("ops:pw")))
            .body(Body::empty())
            .unwrap();
        let (status, _) = get_with(node.api().with_config(&config).router(), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_agent_is_unavailable() {
        let node = Node::start().await;
        node.agent.shutdown().unwrap();
        while !node.agent.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (status, body) = get(node.api().router(), "/state").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "agent unavailable");
    }
}
