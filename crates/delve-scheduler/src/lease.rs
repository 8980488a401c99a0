//! Reservation expiry and idle teardown.
//!
//! Both run from the health monitor's healthy callback, so they only ever
//! see instances that just answered a probe.

use std::time::Duration;

use tracing::{debug, info, warn};

use delve_core::epoch_secs;
use delve_lock::kinds;
use delve_state::*;

use crate::SchedulerContext;
use crate::claims::ClaimLedger;
use crate::error::SchedulerResult;

#[derive(Clone)]
pub struct LeaseManager {
    ctx: SchedulerContext,
    ledger: ClaimLedger,
}

impl LeaseManager {
    pub fn new(ctx: SchedulerContext, ledger: ClaimLedger) -> Self {
        Self { ctx, ledger }
    }

    /// Healthy callback: expire stale reservations, then tear down idle
    /// in-use instances.
    pub async fn on_healthy(&self, instance: DungeonInstance) {
        match self.expire_reservation(&instance).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => warn!(name = %instance.name, error = %e, "reservation expiry failed"),
        }
        if let Err(e) = self.teardown_if_idle(&instance).await {
            warn!(name = %instance.name, error = %e, "idle teardown failed");
        }
    }

    /// Release a reservation the player never used.
    ///
    /// Applies to pool instances `reserved` for longer than the reservation
    /// grace window. The player's claim on this instance is invalidated,
    /// the player is told, and the instance goes to `rebuilding` with a
    /// teardown scheduled. Returns whether the reservation was expired.
    pub async fn expire_reservation(&self, instance: &DungeonInstance) -> SchedulerResult<bool> {
        if !self.ctx.pool.is_pool(&instance.name) || instance.state != InstanceStatus::Reserved {
            return Ok(false);
        }
        let grace = self.ctx.config.reservation_grace_secs();
        let now = epoch_secs();
        let expired = instance
            .reserved_at
            .is_none_or(|at| at.saturating_add(grace) <= now);
        if !expired {
            return Ok(false);
        }

        let released = self.ctx.state.compare_and_swap_instance(
            &instance.table_key(),
            InstanceStatus::Reserved,
            |i| {
                i.state = InstanceStatus::Rebuilding;
                i.requires_rebuild = true;
                i.clear_reservation();
                i.updated_at = now;
            },
        )?;
        if released.is_none() {
            debug!(name = %instance.name, "reservation changed before expiry, skipping");
            return Ok(false);
        }

        let player = instance.reserved_by.clone().unwrap_or_default();
        info!(name = %instance.name, %player, grace_secs = grace, "reservation expired");
        self.ctx
            .notify_ops(&format!(
                "Dungeon instance {} was reserved for {} but not joined within {} seconds, releasing it",
                instance.name, player, grace
            ))
            .await;

        if !player.is_empty() {
            self.release_player(&player, &instance.name, grace).await?;
        }
        self.schedule_teardown(&instance.name).await?;
        Ok(true)
    }

    async fn release_player(&self, player: &str, instance: &str, grace: u64) -> SchedulerResult<()> {
        let claim = self.ctx.state.active_claim_for(player)?;
        let Some(claim) = claim.filter(|c| c.claimant.as_deref() == Some(instance)) else {
            return Ok(());
        };
        self.ledger
            .invalidate(&claim.id, "reservation expired before the player joined")
            .await?;
        let message = format!(
            "You did not join your dungeon within {}. Your dungeon has been released",
            describe_window(grace)
        );
        self.ledger.send_player_home(player, Some(&message))?;
        Ok(())
    }

    /// Ask an empty in-use instance to shut down.
    ///
    /// Applies to pool instances `in-use` with no active players for longer
    /// than the idle grace window. Players still recorded on the instance
    /// are sent back to the lobby. The teardown lock keeps this to one
    /// command per lock window. Returns whether a teardown was scheduled.
    pub async fn teardown_if_idle(&self, instance: &DungeonInstance) -> SchedulerResult<bool> {
        if !self.ctx.pool.is_pool(&instance.name)
            || instance.state != InstanceStatus::InUse
            || instance.active_players > 0
        {
            return Ok(false);
        }
        let grace = self.ctx.config.idle_teardown_grace_secs;
        let now = epoch_secs();
        let idle = instance
            .in_use_at
            .is_none_or(|at| at.saturating_add(grace) <= now);
        if !idle {
            return Ok(false);
        }

        if self.ctx.locker.present(kinds::TEARDOWN, &instance.name).await? {
            debug!(name = %instance.name, "teardown already scheduled");
            return Ok(false);
        }

        info!(name = %instance.name, idle_secs = grace, "tearing down idle instance");
        self.ctx
            .notify_ops(&format!(
                "Dungeon instance {} was marked as in-use without any online players over {}, tearing it down",
                instance.name,
                describe_window(grace)
            ))
            .await;

        for player in self.ctx.state.list_players()? {
            let stranded = player.server == instance.name
                && matches!(
                    player.state,
                    PlayerState::InDungeon | PlayerState::InTransitToDungeon
                );
            if !stranded {
                continue;
            }
            warn!(player = %player.name, name = %instance.name, "player stranded on idle instance");
            if let Some(claim_id) = player.active_claim_id.as_deref() {
                self.ledger
                    .invalidate(claim_id, "dungeon torn down while idle")
                    .await?;
            }
            self.ledger.send_player_home(&player.name, None)?;
        }

        self.schedule_teardown(&instance.name).await
    }

    /// Release any reservation still held for `player`. Used when the
    /// player's claim is found to be gone. Returns how many were released.
    pub async fn release_leases_for(&self, player: &str) -> SchedulerResult<usize> {
        let now = epoch_secs();
        let mut released = 0;
        for instance in self.ctx.state.list_instances()? {
            if instance.state != InstanceStatus::Reserved || !instance.is_reserved_for(player) {
                continue;
            }
            let swapped = self.ctx.state.compare_and_swap_instance(
                &instance.table_key(),
                InstanceStatus::Reserved,
                |i| {
                    i.state = InstanceStatus::Rebuilding;
                    i.requires_rebuild = true;
                    i.clear_reservation();
                    i.updated_at = now;
                },
            )?;
            if swapped.is_some() {
                info!(name = %instance.name, %player, "orphaned reservation released");
                self.schedule_teardown(&instance.name).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Queue a shutdown-if-empty command unless one went out within the
    /// teardown lock window.
    async fn schedule_teardown(&self, instance: &str) -> SchedulerResult<bool> {
        let ttl = Duration::from_secs(self.ctx.config.teardown_lock_secs);
        if !self.ctx.locker.try_acquire(kinds::TEARDOWN, instance, ttl).await? {
            debug!(name = %instance, "teardown lock held, not rescheduling");
            return Ok(false);
        }
        self.ctx.commands.shutdown_if_empty(instance)?;
        Ok(true)
    }
}

/// "5 minutes", "1 minute", "45 seconds".
fn describe_window(secs: u64) -> String {
    match secs {
        60 => "1 minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{s} seconds"),
    }
}
