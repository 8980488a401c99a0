//! delve-reactor — reacts to telemetry events sent by game servers.
//!
//! Every event is dispatched by name to a handler that updates players,
//! instances, claims, cards or scores, and is then stored together with its
//! processing outcome. A failed handler still leaves a stored event marked
//! `processing_failed`, so no telemetry is dropped.
//!
//! Handlers run concurrently with the scheduler's control loop. State
//! transitions go through single-record transactions and tolerate the
//! record having moved since it was read.

pub mod announce;
pub mod error;
mod instances;
mod players;
pub mod reactor;
mod runs;

pub use error::{ReactorError, ReactorResult};
pub use reactor::EventReactor;

/// Event names understood by the reactor. Anything else is stored as is.
pub mod names {
    pub const JOINED_NETWORK: &str = "joined-network";
    pub const LEFT_NETWORK: &str = "left-network";
    pub const PLAYER_SEEN: &str = "player-seen";
    pub const ALLOWED_TO_PLAY: &str = "allowed-to-play";
    pub const JOINED_QUEUE: &str = "joined-queue";
    pub const SERVER_ONLINE: &str = "server-online";
    pub const SERVER_CLOSING: &str = "server-closing";
    pub const DUNGEON_READY: &str = "dungeon-ready";
    pub const DUNGEON_CLOSED: &str = "dungeon-closed";
    pub const CLEAR_DUNGEON: &str = "clear-dungeon";
    pub const CLAIM_INVALIDATED: &str = "claim-invalidated";
    pub const CARD_VISIBILITY_UPDATED: &str = "card-visibility-updated";
    pub const TRADE_REQUESTED: &str = "trade-requested";
    pub const GAME_WON: &str = "game-won";
    pub const GAME_LOST: &str = "game-lost";
    pub const PLAYER_DIED: &str = "player-died";
    pub const HARDCORE_DECK_RESET: &str = "hardcore-deck-reset";
    pub const SHUTDOWN_ALL_EMPTY: &str = "shutdown-all-empty-dungeons";
}
