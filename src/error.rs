use thiserror::Error;
use uuid::Uuid;

use crate::model::JobStatus;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for OrchestratorError {
    fn from(err: redis::RedisError) -> Self {
        OrchestratorError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
