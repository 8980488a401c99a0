//! Claim state changes and the side effects that go with them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use delve_core::epoch_secs;
use delve_state::*;

use crate::SchedulerContext;
use crate::error::SchedulerResult;

/// Game-outcome bookkeeping run after a dungeon claim is invalidated.
///
/// Best-effort: a failure is logged and never undoes the invalidation.
#[async_trait]
pub trait RunFinalizer: Send + Sync {
    async fn finalize(&self, claim: &Claim) -> anyhow::Result<()>;
}

/// Counts runs that were dispatched to an instance but never finished.
pub struct AbandonedRunFinalizer {
    state: StateStore,
}

impl AbandonedRunFinalizer {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl RunFinalizer for AbandonedRunFinalizer {
    async fn finalize(&self, claim: &Claim) -> anyhow::Result<()> {
        // Never left the queue, nothing to record.
        if claim.claimant.is_none() {
            return Ok(());
        }
        let key = run_score_key(&claim.metadata, "abandoned");
        let total = self.state.add_score(&claim.player, &key, 1, epoch_secs())?;
        debug!(player = %claim.player, %key, total, "abandoned run recorded");
        Ok(())
    }
}

#[derive(Clone)]
pub struct ClaimLedger {
    ctx: SchedulerContext,
    finalizer: Option<Arc<dyn RunFinalizer>>,
}

impl ClaimLedger {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            ctx,
            finalizer: None,
        }
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn RunFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Move a non-terminal claim to `invalid`.
    ///
    /// The owning player is detached (back to the lobby state) when this was
    /// their active claim, operators are told, and dungeon claims go through
    /// the finalizer. Returns `None` when the claim is missing or already
    /// terminal, in which case nothing else happens.
    pub async fn invalidate(&self, claim_id: &str, reason: &str) -> SchedulerResult<Option<Claim>> {
        let mut changed = false;
        let updated = self.ctx.state.update_claim(claim_id, |claim| {
            if claim.is_active() {
                claim.state = ClaimState::Invalid;
                claim.state_reason = Some(reason.to_string());
                changed = true;
            }
        })?;
        let Some(claim) = updated.filter(|_| changed) else {
            return Ok(None);
        };

        let now = epoch_secs();
        self.ctx.state.update_player(&claim.player, |p| {
            if p.active_claim_id.as_deref() == Some(claim.id.as_str()) {
                p.return_to_lobby(now);
                p.queued_at = None;
            }
        })?;

        info!(claim = %claim.id, player = %claim.player, %reason, "claim invalidated");
        self.ctx
            .notify_ops(&format!(
                "Claim {} for {} was invalidated: {}",
                claim.id, claim.player, reason
            ))
            .await;

        if claim.claim_type == ClaimType::Dungeon {
            if let Some(ref finalizer) = self.finalizer {
                if let Err(e) = finalizer.finalize(&claim).await {
                    warn!(claim = %claim.id, error = %e, "run finalization failed");
                }
            }
        }
        Ok(Some(claim))
    }

    pub async fn invalidate_for_player(&self, player: &str, reason: &str) -> SchedulerResult<Option<Claim>> {
        match self.ctx.state.active_claim_for(player)? {
            Some(claim) => self.invalidate(&claim.id, reason).await,
            None => Ok(None),
        }
    }

    /// Close out a claim whose run completed. The player keeps their state
    /// but no longer points at the claim.
    pub fn finalize(&self, claim_id: &str) -> SchedulerResult<Option<Claim>> {
        let mut changed = false;
        let updated = self.ctx.state.update_claim(claim_id, |claim| {
            if claim.is_active() {
                claim.state = ClaimState::Finalized;
                changed = true;
            }
        })?;
        let Some(claim) = updated.filter(|_| changed) else {
            return Ok(None);
        };
        self.ctx.state.update_player(&claim.player, |p| {
            if p.active_claim_id.as_deref() == Some(claim.id.as_str()) {
                p.active_claim_id = None;
            }
        })?;
        debug!(claim = %claim.id, player = %claim.player, "claim finalized");
        Ok(Some(claim))
    }

    /// Put a player back in the lobby.
    ///
    /// A player sitting on a pool instance is also told to connect to the
    /// lobby. `message` is delivered on whichever server the player ends up
    /// on.
    pub fn send_player_home(&self, player: &str, message: Option<&str>) -> SchedulerResult<Option<Player>> {
        let lobby = self.ctx.config.lobby_server.as_str();
        let now = epoch_secs();
        let mut moved_from = None;
        let updated = self.ctx.state.update_player(player, |p| {
            if self.ctx.pool.is_pool(&p.server) {
                moved_from = Some(std::mem::replace(&mut p.server, lobby.to_string()));
            }
            p.return_to_lobby(now);
            p.queued_at = None;
        })?;
        let Some(updated) = updated else {
            return Ok(None);
        };

        if let Some(ref from) = moved_from {
            self.ctx.commands.connect_player(from, player, lobby)?;
        }
        if let Some(text) = message {
            self.ctx.commands.message_player(&updated.server, player, text)?;
        }
        debug!(%player, from = ?moved_from, "player sent back to lobby");
        Ok(Some(updated))
    }

    /// Eviction callback: claims that leased the evicted instance are dead.
    pub async fn on_evicted(&self, instance: DungeonInstance) {
        let reason = format!("instance {} was evicted", instance.name);
        if let Err(e) = self.release_instance_claims(&instance, &reason).await {
            warn!(name = %instance.name, error = %e, "failed to release claims of evicted instance");
        }
    }

    /// Invalidate the claims leasing a removed instance and send their
    /// players home. Claims whose player holds a lease on another instance
    /// registered under the same name are kept. Returns the invalidated
    /// claims.
    pub async fn release_instance_claims(
        &self,
        instance: &DungeonInstance,
        reason: &str,
    ) -> SchedulerResult<Vec<Claim>> {
        let survivors = self.ctx.state.instances_named(&instance.name)?;
        let mut released = Vec::new();
        for claim in self.ctx.state.active_claims_for_claimant(&instance.name)? {
            if survivors.iter().any(|i| i.is_reserved_for(&claim.player)) {
                continue;
            }
            match self.invalidate(&claim.id, reason).await {
                Ok(Some(claim)) => {
                    let message = "Your dungeon became unavailable. Your run was cancelled.";
                    if let Err(e) = self.send_player_home(&claim.player, Some(message)) {
                        warn!(player = %claim.player, error = %e, "failed to send player home");
                    }
                    released.push(claim);
                }
                Ok(None) => {}
                Err(e) => warn!(claim = %claim.id, error = %e, "failed to invalidate claim"),
            }
        }
        Ok(released)
    }
}
