//! Admission — matches queued players to available pool instances.
//!
//! Players are admitted one at a time, oldest queue entry first. Each
//! admission reserves an instance with a compare-and-swap on its state,
//! probes it, and only then dispatches the player.

use tracing::{debug, info, warn};

use delve_core::epoch_secs;
use delve_health::{HealthMonitor, ProbeResult};
use delve_state::*;

use crate::SchedulerContext;
use crate::error::{SchedulerError, SchedulerResult};

/// Outcome counts for one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub admitted: usize,
    /// Players left waiting because no instance matched.
    pub waiting: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AdmissionController {
    ctx: SchedulerContext,
    health: HealthMonitor,
}

impl AdmissionController {
    pub fn new(ctx: SchedulerContext, health: HealthMonitor) -> Self {
        Self { ctx, health }
    }

    /// Try to admit every eligible queued player. Per-player failures are
    /// logged and counted; they never stop the pass.
    pub async fn run(&self) -> SchedulerResult<AdmissionReport> {
        let mut report = AdmissionReport::default();
        let queued = self.queued_players(epoch_secs())?;
        if queued.is_empty() {
            return Ok(report);
        }
        debug!(count = queued.len(), "admitting queued players");

        for player in queued {
            match self.admit(&player).await {
                Ok(Some(_)) => report.admitted += 1,
                Ok(None) => report.waiting += 1,
                Err(e) if e.is_transient() => {
                    debug!(player = %player.name, error = %e, "admission attempt dropped");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(player = %player.name, error = %e, "admission failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Allowed players in the queue who were seen recently, oldest queue
    /// entry first.
    pub fn queued_players(&self, now: u64) -> SchedulerResult<Vec<Player>> {
        let recency = self.ctx.config.queue_recency_secs;
        let mut players: Vec<Player> = self
            .ctx
            .state
            .list_players()?
            .into_iter()
            .filter(|p| {
                p.state == PlayerState::InQueue
                    && p.allowed_to_play
                    && p.last_seen
                        .is_some_and(|seen| seen.saturating_add(recency) >= now)
            })
            .collect();
        players.sort_by_key(|p| (p.queued_at.unwrap_or(u64::MAX), p.name.clone()));
        Ok(players)
    }

    /// Pool instances `claim` may be placed on, longest-healthy first.
    pub fn candidates(&self, claim: &Claim, now: u64) -> SchedulerResult<Vec<DungeonInstance>> {
        let debounce = self.ctx.config.healthy_debounce_secs;
        let mut candidates: Vec<DungeonInstance> = self
            .ctx
            .state
            .list_instances()?
            .into_iter()
            .filter(|i| {
                self.ctx.pool.is_pool(&i.name)
                    && i.state == InstanceStatus::Available
                    && !i.requires_rebuild
                    && i.healthy_since
                        .is_some_and(|since| since.saturating_add(debounce) <= now)
                    && i.capabilities.allows(&claim.metadata)
            })
            .collect();
        candidates.sort_by_key(|i| (i.healthy_since, i.name.clone()));
        Ok(candidates)
    }

    /// Admit one player. Returns the reserved instance, or `None` if no
    /// instance currently fits.
    pub async fn admit(&self, player: &Player) -> SchedulerResult<Option<DungeonInstance>> {
        let now = epoch_secs();
        let claim = self
            .ctx
            .state
            .active_claim_for(&player.name)?
            .ok_or_else(|| SchedulerError::MissingClaim(player.name.clone()))?;

        let Some(candidate) = self.candidates(&claim, now)?.into_iter().next() else {
            debug!(player = %player.name, "no eligible instance");
            return Ok(None);
        };

        let reserved = self
            .ctx
            .state
            .compare_and_swap_instance(&candidate.table_key(), InstanceStatus::Available, |i| {
                i.state = InstanceStatus::Reserved;
                i.reserved_by = Some(player.name.clone());
                i.reserved_at = Some(now);
                i.updated_at = now;
            })?
            .ok_or_else(|| SchedulerError::LostRace(candidate.name.clone()))?;

        if self.health.probe(&reserved.address).await == ProbeResult::Unreachable {
            // The claim stays pending, so the player is retried next tick.
            self.health.degrade(&reserved).await?;
            return Err(SchedulerError::Unreachable(reserved.name));
        }

        self.dispatch(player, &claim, &reserved).await?;
        Ok(Some(reserved))
    }

    async fn dispatch(&self, player: &Player, claim: &Claim, instance: &DungeonInstance) -> SchedulerResult<()> {
        let now = epoch_secs();
        let moved = self.ctx.state.update_player(&player.name, |p| {
            p.state = PlayerState::InTransitToDungeon;
            p.updated_at = now;
        })?;
        if moved.is_none() {
            return Err(SchedulerError::PlayerNotFound(player.name.clone()));
        }

        self.ctx.state.update_claim(&claim.id, |c| {
            c.state = ClaimState::Acquired;
            c.claimant = Some(instance.name.clone());
            c.metadata
                .insert(meta::ACQUIRED_AT.to_string(), now.to_string());
        })?;

        info!(player = %player.name, instance = %instance.name, claim = %claim.id, "player admitted");
        self.ctx
            .notify_ops(&format!("Sending {} to {}", player.name, instance.name))
            .await;

        let arguments = claim
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let commands = &self.ctx.commands;
        commands.prepare_for_player(&instance.name, &player.name, arguments)?;
        commands.message_player(
            &player.server,
            &player.name,
            &format!("Your dungeon is ready! Sending you to {}", instance.name),
        )?;
        commands.connect_player(&player.server, &player.name, &instance.name)?;
        Ok(())
    }
}
