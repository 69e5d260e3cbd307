use thiserror::Error;

use berth_model::{TaskId, UpdateUuid};

/// Violations of the per-task delivery discipline.
///
/// Most of these are protocol noise: callers log them and move on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatusUpdateError {
    #[error("duplicate status update {uuid}")]
    Duplicate { uuid: UpdateUuid },

    #[error("unexpected acknowledgement {got}, expected {expected:?}")]
    UnexpectedAcknowledgement {
        expected: Option<UpdateUuid>,
        got: UpdateUuid,
    },

    #[error("no status update stream for task {task_id}")]
    UnknownStream { task_id: TaskId },

    #[error("status update stream for task {task_id} is terminated")]
    Terminated { task_id: TaskId },

    #[error("failed to persist status update: {0}")]
    Persistence(String),

    #[error("status update manager is not running")]
    ManagerGone,
}
