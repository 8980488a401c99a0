//! Operator and player-facing notification sinks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::NotifyResult;
use crate::commands::CommandQueue;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Free-text message for operators.
    async fn ops(&self, text: &str) -> NotifyResult<()>;

    /// Player-facing announcement. Announcements sharing a correlation id
    /// describe the same run; sinks that can edit should update in place.
    async fn announce(&self, correlation_id: &str, text: &str) -> NotifyResult<()>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Delivers through the command queue: operator messages and lobby
/// broadcasts executed by the lobby server.
#[derive(Clone)]
pub struct CommandQueueNotifier {
    queue: CommandQueue,
    lobby: String,
}

impl CommandQueueNotifier {
    pub fn new(queue: CommandQueue, lobby: &str) -> Self {
        Self {
            queue,
            lobby: lobby.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for CommandQueueNotifier {
    async fn ops(&self, text: &str) -> NotifyResult<()> {
        self.queue.message_ops(&self.lobby, text)?;
        Ok(())
    }

    async fn announce(&self, _correlation_id: &str, text: &str) -> NotifyResult<()> {
        self.queue.broadcast(&self.lobby, text)?;
        Ok(())
    }
}

/// Fan-out over several sinks. Every sink is attempted; the first error is
/// returned after the rest have run.
#[derive(Clone, Default)]
pub struct Notifiers {
    sinks: Vec<SharedNotifier>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedNotifier) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for Notifiers {
    async fn ops(&self, text: &str) -> NotifyResult<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.ops(text).await {
                warn!(error = %e, "ops notification failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn announce(&self, correlation_id: &str, text: &str) -> NotifyResult<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.announce(correlation_id, text).await {
                warn!(%correlation_id, error = %e, "announcement failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
