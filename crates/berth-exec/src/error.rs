use thiserror::Error;

use berth_core::error::CoreError;
use berth_model::ContainerId;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    #[error("boundary {0} already exists")]
    AlreadyExists(ContainerId),

    #[error("unknown boundary {0}")]
    UnknownContainer(ContainerId),

    #[error("{0} is not supported by this launcher")]
    Unsupported(&'static str),

    #[error("failed to signal boundary {container}: {source}")]
    Signal {
        container: ContainerId,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for CoreError {
    fn from(e: ExecError) -> Self {
        CoreError::Containerizer(e.to_string())
    }
}
