//! Claim reconciliation.
//!
//! Each tick, non-terminal claims untouched for longer than the debounce
//! window are checked against the records they depend on: the owning
//! player, and for dispatched claims the instance holding the lease. A
//! claim whose dependencies are gone is invalidated.

use tracing::{debug, info, warn};

use delve_core::epoch_secs;
use delve_state::*;

use crate::SchedulerContext;
use crate::claims::ClaimLedger;
use crate::error::SchedulerResult;
use crate::lease::LeaseManager;

/// Shown to a player whose dispatched run lost its instance.
const REFUND_MESSAGE: &str =
    "Your dungeon became unavailable before your run finished. Your run was cancelled and your entry refunded.";

/// What reconciliation did with one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Consistent,
    Invalidated(String),
    /// A persisting run whose player has left; its results are complete.
    Finalized,
}

#[derive(Clone)]
pub struct ClaimReconciler {
    ctx: SchedulerContext,
    ledger: ClaimLedger,
    lease: LeaseManager,
}

impl ClaimReconciler {
    pub fn new(ctx: SchedulerContext, ledger: ClaimLedger, lease: LeaseManager) -> Self {
        Self { ctx, ledger, lease }
    }

    /// Reconcile every stale claim. Returns how many were invalidated.
    /// A failure on one claim is logged and the pass moves on.
    pub async fn run(&self) -> SchedulerResult<usize> {
        let cutoff = epoch_secs().saturating_sub(self.ctx.config.reconcile_debounce_secs);
        let stale: Vec<Claim> = self
            .ctx
            .state
            .list_active_claims()?
            .into_iter()
            .filter(|c| c.updated_at <= cutoff)
            .collect();

        let mut invalidated = 0;
        for claim in stale {
            match self.reconcile(&claim).await {
                Ok(Verdict::Invalidated(_)) => invalidated += 1,
                Ok(_) => {}
                Err(e) => warn!(claim = %claim.id, error = %e, "claim reconciliation failed"),
            }
        }
        if invalidated > 0 {
            info!(invalidated, "claims reconciled");
        }
        Ok(invalidated)
    }

    /// Check one claim against its player and, once dispatched, its lease.
    pub async fn reconcile(&self, claim: &Claim) -> SchedulerResult<Verdict> {
        let player = self.ctx.state.get_player(&claim.player)?;

        let player_reason = match player {
            None => Some("player record is missing".to_string()),
            Some(ref p) if p.active_claim_id.as_deref() != Some(claim.id.as_str()) => {
                Some("player no longer references this claim".to_string())
            }
            Some(ref p) if !p.state.holds_claim() => {
                Some(format!("player is {:?}, which cannot hold a claim", p.state))
            }
            Some(_) => None,
        };
        if let Some(reason) = player_reason {
            if claim.state == ClaimState::Persisting {
                self.ledger.finalize(&claim.id)?;
                debug!(claim = %claim.id, %reason, "persisting claim finalized after player left");
                return Ok(Verdict::Finalized);
            }
            self.ledger.invalidate(&claim.id, &reason).await?;
            let released = self.lease.release_leases_for(&claim.player).await?;
            debug!(claim = %claim.id, released, "orphaned claim invalidated");
            return Ok(Verdict::Invalidated(reason));
        }

        if matches!(claim.state, ClaimState::Acquired | ClaimState::InUse) {
            let leased = match claim.claimant.as_deref() {
                Some(name) => self.holds_lease(name, &claim.player)?,
                None => false,
            };
            if !leased {
                let reason = format!(
                    "claimant {} no longer holds the lease",
                    claim.claimant.as_deref().unwrap_or("<none>")
                );
                self.ledger.invalidate(&claim.id, &reason).await?;
                self.ledger
                    .send_player_home(&claim.player, Some(REFUND_MESSAGE))?;
                return Ok(Verdict::Invalidated(reason));
            }
        }
        Ok(Verdict::Consistent)
    }

    /// An instance named `name` is reserved, in use or unreachable with a
    /// lease held by `player`. Unreachable records are still inside their
    /// eviction grace window.
    fn holds_lease(&self, name: &str, player: &str) -> SchedulerResult<bool> {
        Ok(self
            .ctx
            .state
            .instances_named(name)?
            .iter()
            .any(|i| match i.state {
                InstanceStatus::Reserved | InstanceStatus::InUse | InstanceStatus::Unreachable => {
                    i.is_reserved_for(player)
                }
                _ => false,
            }))
    }
}
