//! delve-notify — everything Delve says to the outside world.
//!
//! Two channels:
//!
//! - [`CommandQueue`] writes [`Task`](delve_state::Task) records that game
//!   servers poll and execute (move a player, send chat, shut down).
//! - [`Notifier`] implementations deliver free-text operator messages and
//!   player-facing announcements keyed by a correlation id (the run id),
//!   so a sink that supports editing updates one message per run instead
//!   of posting duplicates.
//!
//! Notification delivery is best-effort. Callers log failures and carry on.

pub mod commands;
pub mod notifier;
pub mod webhook;

pub use commands::CommandQueue;
pub use notifier::{CommandQueueNotifier, Notifier, Notifiers, SharedNotifier};
pub use webhook::WebhookNotifier;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("state store error: {0}")]
    State(#[from] delve_state::StateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook rejected message: status {0}")]
    Rejected(u16),
}

pub type NotifyResult<T> = Result<T, NotifyError>;
