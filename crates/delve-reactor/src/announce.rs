//! Best-effort announcements around event processing.
//!
//! Failures are logged and never affect the event outcome. Run
//! announcements are correlated by run id so a sink that supports editing
//! updates one message per run.

use tracing::warn;

use delve_core::epoch_secs;
use delve_state::{EventRecord, Metadata, NewEvent, meta};

use crate::names;
use crate::reactor::EventReactor;

/// A player absent for longer than this is announced again on return.
const RETURNING_AFTER_SECS: u64 = 300;

const DIFFICULTY_PREFIX: &str = "difficulty-selected-";

/// Per-run tallies shown when a run is won.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dangers: i64,
    pub cards_played: i64,
    pub cards_bought: i64,
}

impl RunSummary {
    pub fn from_events(events: &[EventRecord]) -> Self {
        let mut summary = Self::default();
        for event in events {
            let count = event.count.unwrap_or(1);
            match event.name.as_str() {
                "hazard-activated" | "clank-generated" => summary.dangers += count,
                n if n.starts_with("card-played-") => summary.cards_played += count,
                n if n.starts_with("card-bought-") => summary.cards_bought += count,
                _ => {}
            }
        }
        summary
    }
}

/// "alex queued for a Competitive run (Deck #3)".
pub fn queue_announcement(player: &str, metadata: &Metadata) -> String {
    let kind = match metadata.get(meta::RUN_TYPE).map(String::as_str) {
        Some("c") => "Competitive",
        Some("p") => "Practice",
        _ => "Unknown",
    };
    match metadata.get(meta::DECK_ID) {
        Some(deck) => {
            let number = deck.trim_start_matches(|c: char| !c.is_ascii_digit());
            format!("{player} queued for a {kind} run (Deck #{number})")
        }
        None => format!("{player} queued for a {kind} run"),
    }
}

impl EventReactor {
    /// Announcements that need the state from before the event applies.
    pub(crate) async fn announce_before(&self, event: &NewEvent) {
        if event.name != names::PLAYER_SEEN {
            return;
        }
        let Some(ref name) = event.player else {
            return;
        };
        let known = match self.ctx.state.get_player(name) {
            Ok(known) => known,
            Err(e) => {
                warn!(player = %name, error = %e, "presence lookup failed");
                return;
            }
        };
        let now = epoch_secs();
        let result = match known {
            None if event.server.as_deref() == Some(self.ctx.config.lobby_server.as_str()) => {
                let text = format!("{name} joined the network for the first time! Welcome!");
                self.ctx.notifier.announce(name, &text).await
            }
            Some(p) if p.last_seen.is_none_or(|seen| seen + RETURNING_AFTER_SECS < now) => {
                self.ctx.notifier.ops(&format!("{name} joined the network")).await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(player = %name, error = %e, "presence announcement failed");
        }
    }

    /// Announcements that describe the state after the event applied.
    pub(crate) async fn announce_after(&self, event: &NewEvent) {
        let Some(ref name) = event.player else {
            return;
        };
        let text = match event.name.as_str() {
            names::JOINED_QUEUE => queue_announcement(name, &event.metadata),
            names::GAME_WON => {
                let summary = match event.metadata.get(meta::RUN_ID) {
                    Some(run_id) => match self.ctx.state.events_for_run(run_id) {
                        Ok(events) => RunSummary::from_events(&events),
                        Err(e) => {
                            warn!(%run_id, error = %e, "run summary lookup failed");
                            RunSummary::default()
                        }
                    },
                    None => RunSummary::default(),
                };
                format!(
                    "{name} survived the dungeon!\nDangers encountered: {}\nCards played: {}\nCards bought: {}",
                    summary.dangers, summary.cards_played, summary.cards_bought
                )
            }
            names::GAME_LOST => format!("{name} was defeated by the dungeon"),
            other => match other.strip_prefix(DIFFICULTY_PREFIX) {
                Some(difficulty) => format!("{name} started a run on {difficulty} mode!"),
                None => return,
            },
        };
        let correlation = event
            .metadata
            .get(meta::RUN_ID)
            .map_or(name.as_str(), String::as_str);
        if let Err(e) = self.ctx.notifier.announce(correlation, &text).await {
            warn!(event = %event.name, player = %name, error = %e, "announcement failed");
        }
    }
}
