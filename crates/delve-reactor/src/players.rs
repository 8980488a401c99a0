//! Player presence, permission and queueing.

use std::time::Duration;

use tracing::{debug, info, warn};

use delve_core::epoch_secs;
use delve_lock::kinds;
use delve_state::*;

use crate::error::{ReactorError, ReactorResult};
use crate::reactor::{EventReactor, meta_of, player_of, server_of};

/// Metadata key naming the other side of a trade.
const TRADE_TARGET: &str = "target";
/// Metadata key carrying an invalidation reason.
const REASON: &str = "reason";

impl EventReactor {
    pub(crate) fn joined_network(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let server = server_of(event)?;
        let player = self.touch_player(name, Some(server), None)?;

        if self.ctx.pool.is_pool(server) {
            if player.state == PlayerState::InTransitToDungeon {
                if let Some(claim) = self.ctx.state.active_claim_for(name)? {
                    if claim.claimant.as_deref() == Some(server) {
                        return self.start_run(name, server, &claim);
                    }
                }
            }
            self.adjust_active_players(server, 1)?;
            return Ok(());
        }

        if player.state == PlayerState::InDungeon {
            // The claim stays put; reconciliation decides whether the run
            // finished or was abandoned.
            self.ctx.state.update_player(name, |p| {
                p.state = PlayerState::InLobby;
            })?;
            debug!(player = %name, %server, "player left their dungeon");
        }
        Ok(())
    }

    /// The player arrived on the dungeon reserved for them.
    fn start_run(&self, name: &str, server: &str, claim: &Claim) -> ReactorResult<()> {
        let now = epoch_secs();
        self.ctx.state.update_player(name, |p| {
            p.state = PlayerState::InDungeon;
            p.updated_at = now;
        })?;
        self.ctx.state.update_claim(&claim.id, |c| {
            c.state = ClaimState::InUse;
            c.metadata.insert(meta::STARTED_AT.into(), now.to_string());
        })?;

        let mut started = false;
        for inst in self.ctx.state.instances_named(server)? {
            if !inst.is_reserved_for(name) {
                continue;
            }
            let written = self.ctx.state.update_instance(&inst.table_key(), |i| {
                if !i.is_reserved_for(name) {
                    return false;
                }
                i.state = InstanceStatus::InUse;
                i.in_use_at = Some(now);
                i.active_players = i.active_players.saturating_add(1);
                i.updated_at = now;
                true
            })?;
            started |= written.is_some();
        }
        if !started {
            warn!(player = %name, %server, "no instance reserved for arriving player");
            self.adjust_active_players(server, 1)?;
        }
        info!(player = %name, %server, claim = %claim.id, "run started");
        Ok(())
    }

    pub(crate) fn left_network(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let now = epoch_secs();
        let updated = self.ctx.state.update_player(name, |p| {
            p.last_seen = Some(now);
            p.updated_at = now;
        })?;
        if updated.is_none() {
            debug!(player = %name, "unknown player left");
        }
        if let Some(server) = event.server.as_deref() {
            if self.ctx.pool.is_pool(server) {
                self.adjust_active_players(server, -1)?;
            }
        }
        Ok(())
    }

    pub(crate) fn player_seen(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        self.touch_player(name, event.server.as_deref(), event.location())?;
        Ok(())
    }

    pub(crate) fn allowed_to_play(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let now = epoch_secs();
        let updated = self.ctx.state.update_player(name, |p| {
            p.allowed_to_play = true;
            if let Some(ref server) = event.server {
                p.server = server.clone();
            }
            p.updated_at = now;
        })?;
        if updated.is_none() {
            return Err(ReactorError::PlayerNotFound(name.to_string()));
        }
        info!(player = %name, "player allowed to play");
        Ok(())
    }

    /// Create a pending dungeon claim. A generated run id is written back
    /// into the event so the stored event joins the run.
    pub(crate) fn joined_queue(&self, event: &mut NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?.to_string();
        let player = self
            .ctx
            .state
            .get_player(&name)?
            .ok_or_else(|| ReactorError::PlayerNotFound(name.clone()))?;
        if !player.allowed_to_play {
            return Err(ReactorError::NotAllowed(name));
        }
        if let Some(existing) = self.ctx.state.active_claim_for(&name)? {
            return Err(ReactorError::Conflict(format!(
                "player {name} already holds active claim {}",
                existing.id
            )));
        }

        let now = epoch_secs();
        event
            .metadata
            .entry(meta::RUN_ID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());
        let mut metadata = event.metadata.clone();
        metadata.insert(meta::QUEUED_AT.into(), now.to_string());
        metadata
            .entry(meta::RUN_TYPE.to_string())
            .or_insert_with(|| "p".to_string());
        let deck = metadata.get(meta::DECK_ID).cloned();

        let claim = Claim::new_dungeon(&name, metadata, now);
        self.ctx.state.create_claim(&claim)?;
        self.ctx.state.update_player(&name, |p| {
            p.state = PlayerState::InQueue;
            p.queued_at = Some(now);
            p.active_claim_id = Some(claim.id.clone());
            if deck.is_some() {
                p.last_selected_deck = deck;
            }
            if let Some(ref server) = event.server {
                p.server = server.clone();
            }
            p.last_seen = Some(now);
            p.updated_at = now;
        })?;
        info!(player = %name, claim = %claim.id, run_id = ?claim.run_id(), "player queued");
        Ok(())
    }

    pub(crate) async fn claim_invalidated(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let reason = event
            .metadata
            .get(REASON)
            .map(String::as_str)
            .unwrap_or("invalidated by game server");
        if self.ledger.invalidate_for_player(name, reason).await?.is_none() {
            return Err(ReactorError::NoActiveClaim(name.to_string()));
        }
        self.ledger.send_player_home(name, None)?;
        Ok(())
    }

    pub(crate) fn card_visibility_updated(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let card = Card {
            player: name.to_string(),
            deck_id: meta_of(event, meta::DECK_ID)?.to_string(),
            name: meta_of(event, "card")?.to_string(),
            visible: meta_of(event, "visible")?.eq_ignore_ascii_case("true"),
            updated_at: epoch_secs(),
        };
        self.ctx.state.put_card(&card)?;
        Ok(())
    }

    pub(crate) async fn trade_requested(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let target = meta_of(event, TRADE_TARGET)?;
        let ttl = Duration::from_secs(self.ctx.config.trade_throttle_secs);
        if !self.ctx.locker.try_acquire(kinds::TRADE_REQUEST, name, ttl).await? {
            debug!(player = %name, %target, "trade request throttled");
            return Ok(());
        }
        let recipient = self
            .ctx
            .state
            .get_player(target)?
            .ok_or_else(|| ReactorError::PlayerNotFound(target.to_string()))?;
        self.ctx.commands.message_player(
            &recipient.server,
            target,
            &format!("{name} would like to trade with you"),
        )?;
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Refresh a player's presence, creating the record on first sight.
    pub(crate) fn touch_player(
        &self,
        name: &str,
        server: Option<&str>,
        location: Option<Location>,
    ) -> ReactorResult<Player> {
        let now = epoch_secs();
        let updated = self.ctx.state.update_player(name, |p| {
            if let Some(server) = server {
                p.server = server.to_string();
            }
            if location.is_some() {
                p.last_location = location;
            }
            p.last_seen = Some(now);
            p.updated_at = now;
        })?;
        if let Some(player) = updated {
            return Ok(player);
        }

        let mut player = Player::new(name, server.unwrap_or(self.ctx.config.lobby_server.as_str()), now);
        player.last_location = location;
        self.ctx.state.put_player(&player)?;
        info!(player = %name, server = %player.server, "player created");
        Ok(player)
    }

    /// Bump the online count of every instance registered under `server`.
    pub(crate) fn adjust_active_players(&self, server: &str, delta: i32) -> ReactorResult<()> {
        let now = epoch_secs();
        for inst in self.ctx.state.instances_named(server)? {
            self.ctx.state.update_instance(&inst.table_key(), |i| {
                i.active_players = i.active_players.saturating_add_signed(delta);
                i.updated_at = now;
                true
            })?;
        }
        Ok(())
    }
}
