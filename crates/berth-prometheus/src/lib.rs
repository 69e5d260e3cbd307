//! Prometheus backend for the agent's metrics hooks.
//!
//! [`PrometheusMetrics`] implements [`berth_core::metrics::MetricsBackend`]
//! on a private [`Registry`]. Hand a clone to the agent builder and keep
//! another for the `/metrics` endpoint:
//!
//! ```rust
//! use std::sync::Arc;
//! use berth_core::metrics::MetricsBackend;
//! use berth_prometheus::PrometheusMetrics;
//!
//! let metrics = PrometheusMetrics::new().unwrap();
//! let handle: Arc<dyn MetricsBackend> = Arc::new(metrics.clone());
//! handle.record_ping_timeout();
//! assert!(metrics.encode_text().unwrap().contains("berth_ping_timeouts_total 1"));
//! ```
//!
//! ## Metrics
//! - `berth_tasks_terminal_total{state}`
//! - `berth_executors_terminated_total`
//! - `berth_status_update_retries_total`
//! - `berth_invalid_acknowledgements_total`
//! - `berth_ping_timeouts_total`
//! - `berth_registration_attempts_total{kind}`
//! - `berth_launch_errors_total{kind}`
mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};
