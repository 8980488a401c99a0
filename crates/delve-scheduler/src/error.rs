//! Scheduler error types.
//!
//! `LostRace` and `Unreachable` are transient: the attempt is dropped and
//! the next tick tries again. `MissingClaim`, `PlayerNotFound` and
//! `InstanceNotFound` are structural: the item is skipped and logged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queued player {0} has no active claim")]
    MissingClaim(String),

    #[error("player not found: {0}")]
    PlayerNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("player {player} already holds active claim {claim}")]
    ClaimConflict { player: String, claim: String },

    #[error("lost reservation race for instance {0}")]
    LostRace(String),

    #[error("instance {0} is unreachable")]
    Unreachable(String),

    #[error("state store error: {0}")]
    State(#[from] delve_state::StateError),

    #[error("lock error: {0}")]
    Lock(#[from] delve_lock::LockError),
}

impl SchedulerError {
    /// Whether the next tick is expected to succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LostRace(_) | Self::Unreachable(_))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
