//! Domain types persisted by the Delve state store.
//!
//! Players, dungeon instances, claims, locks, telemetry events, outbound
//! command tasks, scores and cards. Everything is serialized to JSON for
//! storage in redb tables; timestamps are Unix epoch seconds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Open key/value bag carried by claims and events.
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys.
pub mod meta {
    pub const RUN_ID: &str = "run-id";
    pub const DECK_ID: &str = "deck-id";
    /// `p` (practice) or `c` (competitive).
    pub const RUN_TYPE: &str = "run-type";
    pub const QUEUED_AT: &str = "queued-at";
    pub const ACQUIRED_AT: &str = "acquired-at";
    pub const STARTED_AT: &str = "started-at";
    pub const END_TIME: &str = "end-time";
    pub const OUTCOME: &str = "outcome";
    pub const DEATHS: &str = "deaths";
}

// ── Player ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerState {
    InLobby,
    InQueue,
    InTransitToDungeon,
    InDungeon,
    InBuilders,
}

impl PlayerState {
    /// States in which a player is expected to own a non-terminal claim.
    pub fn holds_claim(self) -> bool {
        matches!(
            self,
            Self::InQueue | Self::InTransitToDungeon | Self::InDungeon
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    /// Server the player was last seen on.
    pub server: String,
    pub state: PlayerState,
    pub allowed_to_play: bool,
    pub last_selected_deck: Option<String>,
    pub last_seen: Option<u64>,
    pub last_location: Option<Location>,
    pub active_claim_id: Option<String>,
    pub queued_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Player {
    pub fn new(name: &str, server: &str, now: u64) -> Self {
        Self {
            name: name.to_string(),
            server: server.to_string(),
            state: PlayerState::InLobby,
            allowed_to_play: false,
            last_selected_deck: None,
            last_seen: Some(now),
            last_location: None,
            active_claim_id: None,
            queued_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Drop back to the lobby state, forgetting any claim.
    pub fn return_to_lobby(&mut self, now: u64) {
        self.state = PlayerState::InLobby;
        self.active_claim_id = None;
        self.updated_at = now;
    }
}

// ── Dungeon instance ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// Announced online, not yet ready for players.
    Starting,
    Available,
    Reserved,
    InUse,
    Rebuilding,
    Unreachable,
}

/// Capability key to the set of values an instance accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeMap<String, BTreeSet<String>>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key -> "a,b,c"` pairs as advertised by a game server.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mut set = Self::new();
        for (key, raw) in metadata {
            let values: BTreeSet<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if !values.is_empty() {
                set.0.insert(key.clone(), values);
            }
        }
        set
    }

    pub fn with(mut self, key: &str, values: &[&str]) -> Self {
        self.0.insert(
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key)
    }

    /// True when every key defined on both sides has the requested value
    /// inside the advertised set. Keys only one side knows are ignored.
    pub fn allows(&self, requested: &Metadata) -> bool {
        self.0.iter().all(|(key, allowed)| match requested.get(key) {
            Some(value) => allowed.contains(value),
            None => true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DungeonInstance {
    pub name: String,
    /// Network address (`ip` or `ip:port`) the server announced from.
    pub address: String,
    pub state: InstanceStatus,
    pub capabilities: CapabilitySet,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<u64>,
    pub in_use_at: Option<u64>,
    pub active_players: u32,
    pub requires_rebuild: bool,
    pub healthy_since: Option<u64>,
    pub unhealthy_since: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DungeonInstance {
    pub fn new(name: &str, address: &str, now: u64) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            state: InstanceStatus::Starting,
            capabilities: CapabilitySet::new(),
            reserved_by: None,
            reserved_at: None,
            in_use_at: None,
            active_players: 0,
            requires_rebuild: false,
            healthy_since: None,
            unhealthy_since: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Composite key `{name}/{address}`.
    pub fn table_key(&self) -> String {
        instance_key(&self.name, &self.address)
    }

    pub fn is_reserved_for(&self, player: &str) -> bool {
        self.reserved_by.as_deref() == Some(player)
    }

    pub fn clear_reservation(&mut self) {
        self.reserved_by = None;
        self.reserved_at = None;
    }
}

pub fn instance_key(name: &str, address: &str) -> String {
    format!("{name}/{address}")
}

// ── Claim ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimType {
    Dungeon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimState {
    Pending,
    Acquired,
    InUse,
    Invalid,
    Persisting,
    Finalized,
}

impl ClaimState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Finalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub player: String,
    pub claim_type: ClaimType,
    pub state: ClaimState,
    pub state_reason: Option<String>,
    /// Instance name, set once acquired.
    pub claimant: Option<String>,
    pub metadata: Metadata,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Claim {
    pub fn new_dungeon(player: &str, metadata: Metadata, now: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            player: player.to_string(),
            claim_type: ClaimType::Dungeon,
            state: ClaimState::Pending,
            state_reason: None,
            claimant: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.metadata.get(meta::RUN_ID).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

// ── Lock ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_type: String,
    pub target: String,
    /// Expiry instant.
    pub until: u64,
    pub created_at: u64,
}

impl Lock {
    pub fn table_key(&self) -> String {
        lock_key(&self.lock_type, &self.target)
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.until > now
    }
}

pub fn lock_key(lock_type: &str, target: &str) -> String {
    format!("{lock_type}:{target}")
}

// ── Events ─────────────────────────────────────────────────────────

/// Telemetry event as submitted by a game server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub name: String,
    #[serde(default)]
    pub player: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub z: Option<f64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default, rename = "sourceIP")]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn player(mut self, player: &str) -> Self {
        self.player = Some(player.to_string());
        self
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn source_ip(mut self, ip: &str) -> Self {
        self.source_ip = Some(ip.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn location(&self) -> Option<Location> {
        Some(Location {
            x: self.x?,
            y: self.y?,
            z: self.z?,
        })
    }
}

/// Stored form of a telemetry event, including its processing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub name: String,
    pub player: Option<String>,
    pub server: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub count: Option<i64>,
    pub source_ip: Option<String>,
    pub metadata: Metadata,
    pub run_id: Option<String>,
    pub processing_failed: bool,
    pub error: Option<String>,
    pub created_at: u64,
}

impl EventRecord {
    pub fn from_new(event: NewEvent, now: u64) -> Self {
        let run_id = event.metadata.get(meta::RUN_ID).cloned();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: event.name,
            player: event.player,
            server: event.server,
            x: event.x,
            y: event.y,
            z: event.z,
            count: event.count,
            source_ip: event.source_ip,
            metadata: event.metadata,
            run_id,
            processing_failed: false,
            error: None,
            created_at: now,
        }
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.processing_failed = true;
        self.error = Some(error.to_string());
        self
    }
}

// ── Outbound commands ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    ConnectPlayer,
    KickPlayer,
    MessagePlayer,
    MessageOps,
    SendTitle,
    PlaySound,
    ExecuteCommand,
    ShutdownServerIfEmpty,
    PrepareForPlayer,
    BroadcastMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
}

/// A command queued for a game server to pick up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub server: String,
    pub command: CommandType,
    pub target_player: Option<String>,
    pub arguments: Vec<String>,
    pub state: TaskState,
    pub source_ip: Option<String>,
    pub created_at: u64,
}

impl Task {
    pub fn scheduled(server: &str, command: CommandType, now: u64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            server: server.to_string(),
            command,
            target_player: None,
            arguments: Vec::new(),
            state: TaskState::Scheduled,
            source_ip: None,
            created_at: now,
        }
    }
}

// ── Scores & cards ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub player: String,
    pub key: String,
    pub value: i64,
    pub updated_at: u64,
}

impl Score {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.player, self.key)
    }
}

/// Score key for a run statistic, split by run type: `competitive.wins`,
/// `practice.abandoned`. Runs without a run type count as practice.
pub fn run_score_key(metadata: &Metadata, stat: &str) -> String {
    let mode = match metadata.get(meta::RUN_TYPE).map(String::as_str) {
        Some("c") => "competitive",
        _ => "practice",
    };
    format!("{mode}.{stat}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub player: String,
    pub deck_id: String,
    pub name: String,
    pub visible: bool,
    pub updated_at: u64,
}

impl Card {
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.player, self.deck_id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn run_score_key_splits_by_run_type() {
        assert_eq!(
            run_score_key(&metadata(&[(meta::RUN_TYPE, "c")]), "wins"),
            "competitive.wins"
        );
        assert_eq!(run_score_key(&Metadata::new(), "wins"), "practice.wins");
    }

    #[test]
    fn capability_matching_checks_shared_keys_only() {
        let caps = CapabilitySet::new().with(meta::RUN_TYPE, &["p"]);

        assert!(caps.allows(&metadata(&[(meta::RUN_TYPE, "p")])));
        assert!(!caps.allows(&metadata(&[(meta::RUN_TYPE, "c")])));
        // Claim does not ask for the key: no restriction.
        assert!(caps.allows(&metadata(&[(meta::DECK_ID, "#12")])));
        // Instance does not advertise the key: no restriction.
        assert!(CapabilitySet::new().allows(&metadata(&[(meta::RUN_TYPE, "c")])));
    }

    #[test]
    fn capabilities_parse_comma_separated_values() {
        let caps = CapabilitySet::from_metadata(&metadata(&[
            ("run-type", "p, c"),
            ("region", ""),
        ]));
        let run_types = caps.get("run-type").unwrap();
        assert!(run_types.contains("p") && run_types.contains("c"));
        assert!(caps.get("region").is_none());
    }

    #[test]
    fn claim_terminal_states() {
        assert!(ClaimState::Invalid.is_terminal());
        assert!(ClaimState::Finalized.is_terminal());
        assert!(!ClaimState::Persisting.is_terminal());
        assert!(!ClaimState::Pending.is_terminal());
    }

    #[test]
    fn event_wire_format_uses_camel_case() {
        let json = r#"{"name":"player-seen","player":"alex","sourceIP":"10.0.0.4","x":1.0,"y":64.0,"z":-3.5}"#;
        let event: NewEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.4"));
        assert_eq!(event.location().unwrap().z, -3.5);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn event_record_lifts_run_id() {
        let event = NewEvent::named("game-won").meta(meta::RUN_ID, "run-1");
        let record = EventRecord::from_new(event, 10);
        assert_eq!(record.run_id.as_deref(), Some("run-1"));
        assert!(!record.processing_failed);
    }

    #[test]
    fn player_state_serializes_kebab() {
        let json = serde_json::to_string(&PlayerState::InTransitToDungeon).unwrap();
        assert_eq!(json, "\"in-transit-to-dungeon\"");
        let json = serde_json::to_string(&TaskState::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
