use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown jitter strategy: {0}")]
    UnknownJitter(String),

    #[error("unknown task state: {0}")]
    UnknownTaskState(String),

    #[error("invalid resources '{input}': {reason}")]
    InvalidResources { input: String, reason: String },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid model: {0}")]
    Invalid(String),
}

pub type ModelResult<T> = Result<T, ModelError>;
