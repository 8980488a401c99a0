//! Claim persistence.
//!
//! Every claim write goes through [`write_claim`], which enforces the two
//! claim invariants against the index tables in the same transaction:
//! a player owns at most one non-terminal claim, and a run id belongs to
//! exactly one claim and never changes once assigned.

use redb::{ReadableDatabase, ReadableTable, Table};
use tracing::debug;

use delve_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode};
use crate::tables::*;
use crate::types::*;

type JsonRows<'t> = Table<'t, &'static str, &'static [u8]>;
type IndexRows<'t> = Table<'t, &'static str, &'static str>;

fn write_claim(
    claims: &mut JsonRows<'_>,
    active: &mut IndexRows<'_>,
    runs: &mut IndexRows<'_>,
    claim: &Claim,
    previous: Option<&Claim>,
) -> StateResult<()> {
    if let Some(prev_run) = previous.and_then(Claim::run_id) {
        if claim.run_id() != Some(prev_run) {
            return Err(StateError::Immutable(format!(
                "run-id of claim {} is already '{prev_run}'",
                claim.id
            )));
        }
    }

    if let Some(run_id) = claim.run_id() {
        let owner = runs
            .get(run_id)
            .map_err(map_err!(Read))?
            .map(|g| g.value().to_string());
        match owner {
            Some(owner) if owner != claim.id => {
                return Err(StateError::Conflict(format!(
                    "run id {run_id} already belongs to claim {owner}"
                )));
            }
            Some(_) => {}
            None => {
                runs.insert(run_id, claim.id.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
    }

    let holder = active
        .get(claim.player.as_str())
        .map_err(map_err!(Read))?
        .map(|g| g.value().to_string());
    if claim.is_active() {
        if let Some(holder) = holder.filter(|h| *h != claim.id) {
            let holder_active = match claims.get(holder.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode::<Claim>(guard.value())?.is_active(),
                None => false,
            };
            if holder_active {
                return Err(StateError::Conflict(format!(
                    "player {} already holds active claim {holder}",
                    claim.player
                )));
            }
        }
        active
            .insert(claim.player.as_str(), claim.id.as_str())
            .map_err(map_err!(Write))?;
    } else if holder.as_deref() == Some(claim.id.as_str()) {
        active
            .remove(claim.player.as_str())
            .map_err(map_err!(Write))?;
    }

    let bytes = encode(claim)?;
    claims
        .insert(claim.id.as_str(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

impl StateStore {
    /// Create a new claim.
    ///
    /// This is the single entry point for claim creation. It fails with
    /// [`StateError::Conflict`] when the player already holds a non-terminal
    /// claim or the run id is taken.
    pub fn create_claim(&self, claim: &Claim) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_CLAIMS).map_err(map_err!(Table))?;
            let mut runs = txn.open_table(RUN_INDEX).map_err(map_err!(Table))?;
            if claims
                .get(claim.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!("claim {} already exists", claim.id)));
            }
            write_claim(&mut claims, &mut active, &mut runs, claim, None)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(claim = %claim.id, player = %claim.player, "claim created");
        Ok(())
    }

    /// Store a claim as given (timestamps untouched), still subject to the
    /// claim invariants.
    pub fn put_claim(&self, claim: &Claim) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_CLAIMS).map_err(map_err!(Table))?;
            let mut runs = txn.open_table(RUN_INDEX).map_err(map_err!(Table))?;
            let previous: Option<Claim> = match claims.get(claim.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            write_claim(&mut claims, &mut active, &mut runs, claim, previous.as_ref())?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read-modify-write a claim in one transaction, stamping `updated_at`.
    /// Returns `None` if the claim does not exist.
    pub fn update_claim<F>(&self, id: &str, f: F) -> StateResult<Option<Claim>>
    where
        F: FnOnce(&mut Claim),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_CLAIMS).map_err(map_err!(Table))?;
            let mut runs = txn.open_table(RUN_INDEX).map_err(map_err!(Table))?;
            let previous: Option<Claim> = match claims.get(id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match previous {
                Some(prev) => {
                    let mut next = prev.clone();
                    f(&mut next);
                    next.updated_at = epoch_secs();
                    write_claim(&mut claims, &mut active, &mut runs, &next, Some(&prev))?;
                    Some(next)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    pub fn get_claim(&self, id: &str) -> StateResult<Option<Claim>> {
        self.get_json(CLAIMS, id)
    }

    pub fn list_claims(&self) -> StateResult<Vec<Claim>> {
        self.scan_json(CLAIMS, "")
    }

    /// Claims that are not yet invalid or finalized.
    pub fn list_active_claims(&self) -> StateResult<Vec<Claim>> {
        Ok(self
            .list_claims()?
            .into_iter()
            .filter(Claim::is_active)
            .collect())
    }

    /// The player's non-terminal claim, looked up through the index.
    pub fn active_claim_for(&self, player: &str) -> StateResult<Option<Claim>> {
        let claim_id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let active = txn.open_table(ACTIVE_CLAIMS).map_err(map_err!(Table))?;
            active
                .get(player)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string())
        };
        match claim_id {
            Some(id) => Ok(self.get_claim(&id)?.filter(Claim::is_active)),
            None => Ok(None),
        }
    }

    /// Non-terminal claims leasing the named instance.
    pub fn active_claims_for_claimant(&self, instance: &str) -> StateResult<Vec<Claim>> {
        Ok(self
            .list_active_claims()?
            .into_iter()
            .filter(|c| c.claimant.as_deref() == Some(instance))
            .collect())
    }

    /// The claim that owns `run_id`, if any.
    pub fn claim_for_run(&self, run_id: &str) -> StateResult<Option<Claim>> {
        let claim_id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let runs = txn.open_table(RUN_INDEX).map_err(map_err!(Table))?;
            runs.get(run_id)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string())
        };
        match claim_id {
            Some(id) => self.get_claim(&id),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(player: &str, run_id: &str) -> Claim {
        let mut metadata = Metadata::new();
        metadata.insert(meta::RUN_ID.into(), run_id.into());
        Claim::new_dungeon(player, metadata, 1000)
    }

    #[test]
    fn create_and_lookup_by_player_and_run() {
        let store = StateStore::open_in_memory().unwrap();
        let c = claim("alex", "run-1");
        store.create_claim(&c).unwrap();

        assert_eq!(store.active_claim_for("alex").unwrap(), Some(c.clone()));
        assert_eq!(store.claim_for_run("run-1").unwrap(), Some(c));
        assert!(store.active_claim_for("blair").unwrap().is_none());
    }

    #[test]
    fn second_active_claim_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_claim(&claim("alex", "run-1")).unwrap();

        let err = store.create_claim(&claim("alex", "run-2")).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn new_claim_allowed_after_previous_terminates() {
        let store = StateStore::open_in_memory().unwrap();
        let first = claim("alex", "run-1");
        store.create_claim(&first).unwrap();
        store
            .update_claim(&first.id, |c| c.state = ClaimState::Invalid)
            .unwrap();

        assert!(store.active_claim_for("alex").unwrap().is_none());
        let second = claim("alex", "run-2");
        store.create_claim(&second).unwrap();
        assert_eq!(store.active_claim_for("alex").unwrap().unwrap().id, second.id);
    }

    #[test]
    fn duplicate_run_id_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_claim(&claim("alex", "run-1")).unwrap();

        let err = store.create_claim(&claim("blair", "run-1")).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert!(store.active_claim_for("blair").unwrap().is_none());
    }

    #[test]
    fn run_id_never_changes_across_updates() {
        let store = StateStore::open_in_memory().unwrap();
        let c = claim("alex", "run-1");
        store.create_claim(&c).unwrap();

        for n in 0..5 {
            store
                .update_claim(&c.id, |claim| {
                    claim.metadata.insert(meta::DEATHS.into(), n.to_string());
                })
                .unwrap();
        }
        let err = store
            .update_claim(&c.id, |claim| {
                claim.metadata.insert(meta::RUN_ID.into(), "run-2".into());
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Immutable(_)));

        let removed = store.update_claim(&c.id, |claim| {
            claim.metadata.remove(meta::RUN_ID);
        });
        assert!(removed.is_err());

        let stored = store.get_claim(&c.id).unwrap().unwrap();
        assert_eq!(stored.run_id(), Some("run-1"));
        assert_eq!(stored.metadata.get(meta::DEATHS).map(String::as_str), Some("4"));
    }

    #[test]
    fn run_id_can_be_assigned_once_later() {
        let store = StateStore::open_in_memory().unwrap();
        let c = Claim::new_dungeon("alex", Metadata::new(), 1000);
        store.create_claim(&c).unwrap();

        store
            .update_claim(&c.id, |claim| {
                claim.metadata.insert(meta::RUN_ID.into(), "late-run".into());
            })
            .unwrap();
        assert_eq!(store.claim_for_run("late-run").unwrap().unwrap().id, c.id);
    }

    #[test]
    fn update_stamps_updated_at() {
        let store = StateStore::open_in_memory().unwrap();
        let c = claim("alex", "run-1");
        store.create_claim(&c).unwrap();

        let updated = store
            .update_claim(&c.id, |claim| claim.state = ClaimState::Acquired)
            .unwrap()
            .unwrap();
        assert!(updated.updated_at > 1000);
    }

    #[test]
    fn claimant_lookup_skips_terminal_claims() {
        let store = StateStore::open_in_memory().unwrap();
        let mut live = claim("alex", "run-1");
        live.claimant = Some("d001".into());
        live.state = ClaimState::Acquired;
        let mut dead = claim("blair", "run-2");
        dead.claimant = Some("d001".into());
        dead.state = ClaimState::Invalid;
        store.create_claim(&live).unwrap();
        store.create_claim(&dead).unwrap();

        let found = store.active_claims_for_claimant("d001").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].player, "alex");
    }
}
