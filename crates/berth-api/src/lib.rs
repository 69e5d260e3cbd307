//! Read-only HTTP surface of the agent.
//!
//! Routes:
//! - `GET /state`: agent, frameworks, executors and tasks
//! - `GET /flags`: effective configuration
//! - `GET /containers[?container_id=]`: running containers with status and usage
//! - `GET /monitor/statistics`, `GET /monitor/statistics.json`: per executor usage
//! - `GET /metrics`: prometheus text exposition
mod auth;
mod config;
mod error;
mod http;

pub use auth::Credential;
pub use config::HttpConfig;
pub use error::ApiError;
pub use http::{HttpApi, serve};
