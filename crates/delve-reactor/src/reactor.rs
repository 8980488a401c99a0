//! Event dispatch and persistence.

use tracing::{debug, error, warn};

use delve_core::epoch_secs;
use delve_scheduler::{ClaimLedger, SchedulerContext};
use delve_state::{EventRecord, NewEvent};

use crate::error::{ReactorError, ReactorResult};
use crate::names;

#[derive(Clone)]
pub struct EventReactor {
    pub(crate) ctx: SchedulerContext,
    pub(crate) ledger: ClaimLedger,
}

impl EventReactor {
    pub fn new(ctx: SchedulerContext, ledger: ClaimLedger) -> Self {
        Self { ctx, ledger }
    }

    /// Apply one event and store it.
    ///
    /// The event is stored whatever the handler does. When the handler
    /// fails, the stored copy carries the error and the error is returned.
    /// Handlers may enrich the event's metadata (a generated run id) before
    /// it is stored.
    pub async fn handle(&self, mut event: NewEvent) -> ReactorResult<EventRecord> {
        self.announce_before(&event).await;

        let outcome = self.dispatch(&mut event).await;
        let record = EventRecord::from_new(event.clone(), epoch_secs());

        match outcome {
            Ok(()) => {
                self.ctx.state.put_event(&record)?;
                debug!(name = %record.name, player = ?record.player, "event processed");
                self.announce_after(&event).await;
                Ok(record)
            }
            Err(e) => {
                warn!(name = %record.name, player = ?record.player, error = %e, "event processing failed");
                let failed = record.failed(&e.to_string());
                if let Err(store) = self.ctx.state.put_event(&failed) {
                    error!(name = %failed.name, error = %store, "failed to store failed event");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &mut NewEvent) -> ReactorResult<()> {
        match event.name.as_str() {
            names::JOINED_NETWORK => self.joined_network(event),
            names::LEFT_NETWORK => self.left_network(event),
            names::PLAYER_SEEN => self.player_seen(event),
            names::ALLOWED_TO_PLAY => self.allowed_to_play(event),
            names::JOINED_QUEUE => self.joined_queue(event),
            names::SERVER_ONLINE => self.server_online(event),
            names::SERVER_CLOSING => self.server_closing(event),
            names::DUNGEON_READY => self.dungeon_ready(event),
            names::DUNGEON_CLOSED => self.dungeon_closed(event).await,
            names::CLEAR_DUNGEON => self.clear_dungeon(event),
            names::CLAIM_INVALIDATED => self.claim_invalidated(event).await,
            names::CARD_VISIBILITY_UPDATED => self.card_visibility_updated(event),
            names::TRADE_REQUESTED => self.trade_requested(event).await,
            names::GAME_WON => self.game_over(event, true),
            names::GAME_LOST => self.game_over(event, false),
            names::PLAYER_DIED => self.player_died(event),
            names::HARDCORE_DECK_RESET => self.hardcore_deck_reset(event),
            names::SHUTDOWN_ALL_EMPTY => self.shutdown_all_empty(event).await,
            _ => Ok(()),
        }
    }
}

// ── Field access ───────────────────────────────────────────────────

pub(crate) fn player_of(event: &NewEvent) -> ReactorResult<&str> {
    event.player.as_deref().ok_or(ReactorError::MissingField("player"))
}

pub(crate) fn server_of(event: &NewEvent) -> ReactorResult<&str> {
    event.server.as_deref().ok_or(ReactorError::MissingField("server"))
}

pub(crate) fn meta_of<'a>(event: &'a NewEvent, key: &'static str) -> ReactorResult<&'a str> {
    event
        .metadata
        .get(key)
        .map(String::as_str)
        .ok_or(ReactorError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[tokio::test]
    async fn unknown_events_are_stored() {
        let f = fixture();
        let record = f
            .reactor
            .handle(NewEvent::named("hazard-activated").player("alex"))
            .await
            .unwrap();

        let stored = f.state.get_event(&record.id).unwrap().unwrap();
        assert_eq!(stored.name, "hazard-activated");
        assert!(!stored.processing_failed);
    }

    #[tokio::test]
    async fn failed_events_are_stored_with_the_error() {
        let f = fixture();
        let err = f
            .reactor
            .handle(NewEvent::named(names::ALLOWED_TO_PLAY).player("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReactorError::PlayerNotFound(_)));

        let events = f.state.list_events().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].processing_failed);
        assert!(events[0].error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn missing_fields_are_reported() {
        let f = fixture();
        let err = f
            .reactor
            .handle(NewEvent::named(names::SERVER_ONLINE).server("d001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReactorError::MissingField("sourceIP")));
    }
}
