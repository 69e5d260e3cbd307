use std::sync::Arc;

use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder, proto::MetricFamily};

use berth_core::metrics::{LaunchErrorKind, MetricsBackend, RegistrationKind};
use berth_model::TaskState;

const NAMESPACE: &str = "berth";

/// Counters behind the agent's metrics hooks.
///
/// Labels are bounded: `state` is a terminal task state, `kind` one of the
/// registration or launch error kinds.
#[derive(Clone)]
pub struct PrometheusMetrics {
    tasks_terminal: CounterVec,
    executors_terminated: Counter,
    status_update_retries: Counter,
    invalid_acknowledgements: Counter,
    ping_timeouts: Counter,
    registration_attempts: CounterVec,
    launch_errors: CounterVec,
    registry: Arc<Registry>,
}

impl PrometheusMetrics {
    pub fn new_with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let tasks_terminal = CounterVec::new(
            Opts::new("tasks_terminal_total", "Tasks that reached a terminal state").namespace(NAMESPACE),
            &["state"],
        )?;
        registry.register(Box::new(tasks_terminal.clone()))?;

        let executors_terminated = counter(&registry, "executors_terminated_total", "Executor boundaries reaped")?;
        let status_update_retries = counter(
            &registry,
            "status_update_retries_total",
            "Status updates resent to the controller",
        )?;
        let invalid_acknowledgements = counter(
            &registry,
            "invalid_acknowledgements_total",
            "Acknowledgements dropped as unexpected",
        )?;
        let ping_timeouts = counter(&registry, "ping_timeouts_total", "Controller ping timeouts")?;

        let registration_attempts = CounterVec::new(
            Opts::new("registration_attempts_total", "Registration messages sent").namespace(NAMESPACE),
            &["kind"],
        )?;
        registry.register(Box::new(registration_attempts.clone()))?;

        let launch_errors = CounterVec::new(
            Opts::new("launch_errors_total", "Failed launch steps").namespace(NAMESPACE),
            &["kind"],
        )?;
        registry.register(Box::new(launch_errors.clone()))?;

        Ok(Self {
            tasks_terminal,
            executors_terminated,
            status_update_retries,
            invalid_acknowledgements,
            ping_timeouts,
            registration_attempts,
            launch_errors,
            registry,
        })
    }

    pub fn new() -> Result<Self, prometheus::Error> {
        Self::new_with_registry(Arc::new(Registry::new()))
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Everything in the registry in the text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsBackend for PrometheusMetrics {
    fn record_task_terminal(&self, state: TaskState) {
        self.tasks_terminal.with_label_values(&[state.as_label()]).inc();
    }

    fn record_executor_terminated(&self) {
        self.executors_terminated.inc();
    }

    fn record_status_update_retry(&self) {
        self.status_update_retries.inc();
    }

    fn record_invalid_acknowledgement(&self) {
        self.invalid_acknowledgements.inc();
    }

    fn record_ping_timeout(&self) {
        self.ping_timeouts.inc();
    }

    fn record_registration_attempt(&self, kind: RegistrationKind) {
        self.registration_attempts.with_label_values(&[kind.as_label()]).inc();
    }

    fn record_launch_error(&self, kind: LaunchErrorKind) {
        self.launch_errors.with_label_values(&[kind.as_label()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|f| f.name() == name)
            .unwrap_or_else(|| panic!("metric {name} not found"))
    }

    #[test]
    fn terminal_states_are_split_by_label() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_task_terminal(TaskState::Lost);
        metrics.record_task_terminal(TaskState::Lost);
        metrics.record_task_terminal(TaskState::Gone);

        let families = metrics.gather();
        let terminal = family(&families, "berth_tasks_terminal_total");
        assert_eq!(terminal.get_metric().len(), 2);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"berth_tasks_terminal_total{state="lost"} 2"#), "{text}");
        assert!(text.contains(r#"berth_tasks_terminal_total{state="gone"} 1"#), "{text}");
    }

    #[test]
    fn plain_counters_increment() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_executor_terminated();
        metrics.record_status_update_retry();
        metrics.record_status_update_retry();
        metrics.record_invalid_acknowledgement();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("berth_executors_terminated_total 1"));
        assert!(text.contains("berth_status_update_retries_total 2"));
        assert!(text.contains("berth_invalid_acknowledgements_total 1"));
        assert!(text.contains("berth_ping_timeouts_total 0"));
    }

    #[test]
    fn registration_and_launch_errors_carry_their_kind() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_registration_attempt(RegistrationKind::Register);
        metrics.record_registration_attempt(RegistrationKind::Reregister);
        metrics.record_launch_error(LaunchErrorKind::SecretGeneration);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"berth_registration_attempts_total{kind="reregister"} 1"#));
        assert!(text.contains(r#"berth_launch_errors_total{kind="secret_generation"} 1"#));
    }

    #[test]
    fn shared_registry_rejects_a_second_backend() {
        let registry = Arc::new(Registry::new());
        let _first = PrometheusMetrics::new_with_registry(registry.clone()).unwrap();
        assert!(PrometheusMetrics::new_with_registry(registry).is_err());
    }
}
