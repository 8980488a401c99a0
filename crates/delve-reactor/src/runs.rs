//! Run results: outcomes, deaths, deck resets.

use tracing::{debug, info};

use delve_core::epoch_secs;
use delve_state::*;

use crate::error::{ReactorError, ReactorResult};
use crate::reactor::{EventReactor, meta_of, player_of};

impl EventReactor {
    /// Record the outcome on the run's claim and move it to `persisting`.
    /// The claim is finalized once the player leaves the dungeon.
    pub(crate) fn game_over(&self, event: &mut NewEvent, won: bool) -> ReactorResult<()> {
        let name = player_of(event)?.to_string();
        let claim = self
            .run_claim(event, &name)?
            .ok_or_else(|| ReactorError::NoActiveClaim(name.clone()))?;
        let now = epoch_secs();
        let outcome = if won { "won" } else { "lost" };

        self.ctx.state.update_claim(&claim.id, |c| {
            c.metadata.insert(meta::OUTCOME.into(), outcome.into());
            c.metadata.insert(meta::END_TIME.into(), now.to_string());
            if c.is_active() {
                c.state = ClaimState::Persisting;
            }
        })?;

        let stat = if won { "wins" } else { "losses" };
        self.ctx
            .state
            .add_score(&name, &run_score_key(&claim.metadata, "games"), 1, now)?;
        self.ctx
            .state
            .add_score(&name, &run_score_key(&claim.metadata, stat), 1, now)?;
        tag_run(event, &claim);
        info!(player = %name, claim = %claim.id, %outcome, "run finished");
        Ok(())
    }

    pub(crate) fn player_died(&self, event: &mut NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?.to_string();
        let now = epoch_secs();
        if let Some(claim) = self.run_claim(event, &name)? {
            self.ctx.state.update_claim(&claim.id, |c| {
                let deaths = c
                    .metadata
                    .get(meta::DEATHS)
                    .and_then(|d| d.parse::<u32>().ok())
                    .unwrap_or(0);
                c.metadata.insert(meta::DEATHS.into(), (deaths + 1).to_string());
            })?;
            tag_run(event, &claim);
        } else {
            debug!(player = %name, "death outside of a run");
        }
        self.ctx.state.add_score(&name, "deaths", 1, now)?;
        Ok(())
    }

    pub(crate) fn hardcore_deck_reset(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = player_of(event)?;
        let deck = meta_of(event, meta::DECK_ID)?;
        let removed = self.ctx.state.delete_cards_for_deck(name, deck)?;
        self.ctx
            .state
            .add_score(name, "hardcore-resets", 1, epoch_secs())?;
        info!(player = %name, %deck, removed, "hardcore deck reset");
        Ok(())
    }

    /// The claim an in-run event belongs to: by run id when the event
    /// carries one, otherwise the player's active claim.
    fn run_claim(&self, event: &NewEvent, player: &str) -> ReactorResult<Option<Claim>> {
        match event.metadata.get(meta::RUN_ID) {
            Some(run_id) => Ok(self.ctx.state.claim_for_run(run_id)?),
            None => Ok(self.ctx.state.active_claim_for(player)?),
        }
    }
}

/// Stamp the claim's run id on the event so it is stored with its run.
fn tag_run(event: &mut NewEvent, claim: &Claim) {
    if let Some(run_id) = claim.run_id() {
        event
            .metadata
            .entry(meta::RUN_ID.to_string())
            .or_insert_with(|| run_id.to_string());
    }
}
