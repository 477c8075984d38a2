use crate::models::ContainerState;
use thiserror::Error;

/// Common result type for core operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container id prefix is ambiguous: {0}")]
    Ambiguous(String),
    #[error("container already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid container id")]
    InvalidId,
    #[error("container is in {0} state")]
    InvalidState(ContainerState),
    #[error("failed to start container {id}: {reason}")]
    StartFailed { id: String, reason: String },
    #[error("task unavailable for container {0}")]
    TaskUnavailable(String),
    #[error("container {0} already has a live stdin-once attach session")]
    AttachBusy(String),
    #[error("invalid attach request: {0}")]
    InvalidRequest(String),
    #[error("invalid or expired stream token")]
    InvalidToken,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other error: {0}")]
    Other(String),
}
