use thiserror::Error;

use berth_model::ModelError;

use crate::status_update::StatusUpdateError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("containerizer error: {0}")]
    Containerizer(String),

    #[error("secret generation failed: {0}")]
    Secret(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("detector error: {0}")]
    Detector(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("agent is not running")]
    AgentGone,

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("status update error: {0}")]
    StatusUpdate(#[from] StatusUpdateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
