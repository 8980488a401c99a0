//! Reactor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("player '{0}' not found")]
    PlayerNotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("player '{0}' is not allowed to play")]
    NotAllowed(String),

    #[error("player '{0}' has no active claim")]
    NoActiveClaim(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("state store error: {0}")]
    State(delve_state::StateError),

    #[error("lock error: {0}")]
    Lock(#[from] delve_lock::LockError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] delve_scheduler::SchedulerError),
}

impl From<delve_state::StateError> for ReactorError {
    fn from(e: delve_state::StateError) -> Self {
        match e {
            delve_state::StateError::Conflict(msg) => Self::Conflict(msg),
            other => Self::State(other),
        }
    }
}

pub type ReactorResult<T> = Result<T, ReactorError>;
