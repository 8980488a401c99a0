//! redb table definitions for the Delve state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except the two index tables which map keys to plain ids.

use redb::TableDefinition;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Players keyed by name.
pub const PLAYERS: JsonTable = TableDefinition::new("players");

/// Dungeon instances keyed by `{name}/{address}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Claims keyed by id.
pub const CLAIMS: JsonTable = TableDefinition::new("claims");

/// Player name → id of its non-terminal claim.
pub const ACTIVE_CLAIMS: TableDefinition<&str, &str> = TableDefinition::new("active_claims");

/// Run id → owning claim id.
pub const RUN_INDEX: TableDefinition<&str, &str> = TableDefinition::new("run_index");

/// Advisory locks keyed by `{type}:{target}`.
pub const LOCKS: JsonTable = TableDefinition::new("locks");

/// Telemetry events keyed by time-ordered UUID.
pub const EVENTS: JsonTable = TableDefinition::new("events");

/// Outbound command tasks keyed by time-ordered UUID.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

/// Scores keyed by `{player}:{key}`.
pub const SCORES: JsonTable = TableDefinition::new("scores");

/// Cards keyed by `{player}:{deck_id}:{name}`.
pub const CARDS: JsonTable = TableDefinition::new("cards");
