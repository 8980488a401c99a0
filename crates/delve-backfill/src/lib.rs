//! delve-backfill — copies claim metadata onto the events of its run.
//!
//! Events are stored with whatever metadata the game server sent. Reports
//! want run type, deck and outcome on every event of a run, so a low
//! priority job joins each run's events to its claim through the run id
//! and merges the claim's metadata in.
//!
//! One batch runs at a time per process. Runs younger than the incomplete
//! window that have no end time yet are left for a later batch so partial
//! metadata is not baked in. Merging is idempotent.
//!
//! Batches page through the event table with a cursor, so runs that cannot
//! be merged yet never hold back the ones behind them. The cursor wraps to
//! the start once the table is exhausted and skipped runs are retried.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::StreamExt;
use tracing::{debug, info, warn};

use delve_core::{BackfillConfig, epoch_secs};
use delve_state::{StateResult, StateStore, meta};

/// Counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub merged_runs: usize,
    pub updated_events: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What happened to one run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Merged { events: usize },
    /// No claim owns the run id.
    Orphaned,
    /// Recent and not finished yet.
    Incomplete,
}

#[derive(Clone)]
pub struct BackfillJob {
    state: StateStore,
    config: BackfillConfig,
    running: Arc<AtomicBool>,
    cursor: Arc<Mutex<Option<String>>>,
}

/// Clears the running flag however the batch ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackfillJob {
    pub fn new(state: StateStore, config: BackfillConfig) -> Self {
        Self {
            state,
            config,
            running: Arc::new(AtomicBool::new(false)),
            cursor: Arc::new(Mutex::new(None)),
        }
    }

    /// Run one batch unless another is still in flight, in which case
    /// `None` is returned immediately.
    pub async fn try_run(&self) -> StateResult<Option<BackfillReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("backfill already running, skipping");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);
        self.run_batch().await.map(Some)
    }

    async fn run_batch(&self) -> StateResult<BackfillReport> {
        let after = self.cursor.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let page = self
            .state
            .run_ids_missing_run_type_after(after.as_deref(), self.config.batch_limit)?;
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = page.cursor;
        let run_ids = page.run_ids;
        if run_ids.is_empty() {
            return Ok(BackfillReport::default());
        }
        debug!(runs = run_ids.len(), workers = self.config.workers, "backfilling run metadata");

        let now = epoch_secs();
        let merged_runs = AtomicUsize::new(0);
        let updated_events = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        futures::stream::iter(run_ids)
            .for_each_concurrent(self.config.workers.max(1), |run_id| {
                let state = self.state.clone();
                let window = self.config.incomplete_window_secs;
                let (merged_runs, updated_events, skipped, failed) =
                    (&merged_runs, &updated_events, &skipped, &failed);
                async move {
                    let task_run_id = run_id.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        backfill_run(&state, &task_run_id, now, window)
                    })
                    .await;
                    match outcome {
                        Ok(Ok(RunOutcome::Merged { events })) => {
                            merged_runs.fetch_add(1, Ordering::Relaxed);
                            updated_events.fetch_add(events, Ordering::Relaxed);
                        }
                        Ok(Ok(outcome)) => {
                            debug!(%run_id, ?outcome, "run skipped");
                            skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            warn!(%run_id, error = %e, "run backfill failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(%run_id, error = %e, "run backfill worker panicked");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let report = BackfillReport {
            merged_runs: merged_runs.into_inner(),
            updated_events: updated_events.into_inner(),
            skipped: skipped.into_inner(),
            failed: failed.into_inner(),
        };
        info!(
            merged_runs = report.merged_runs,
            updated_events = report.updated_events,
            skipped = report.skipped,
            failed = report.failed,
            "backfill batch complete"
        );
        Ok(report)
    }
}

/// Merge the owning claim's metadata onto every event of `run_id`.
pub fn backfill_run(
    state: &StateStore,
    run_id: &str,
    now: u64,
    incomplete_window_secs: u64,
) -> StateResult<RunOutcome> {
    let Some(claim) = state.claim_for_run(run_id)? else {
        return Ok(RunOutcome::Orphaned);
    };
    let recent = claim.created_at.saturating_add(incomplete_window_secs) > now;
    if recent && !claim.metadata.contains_key(meta::END_TIME) {
        return Ok(RunOutcome::Incomplete);
    }
    let events = state.merge_run_metadata(run_id, &claim.metadata)?;
    Ok(RunOutcome::Merged { events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_state::{Claim, EventRecord, Metadata, NewEvent};

    fn claim(state: &StateStore, run_id: &str, age_secs: u64, ended: bool) -> Claim {
        let now = epoch_secs();
        let mut metadata = Metadata::new();
        metadata.insert(meta::RUN_ID.into(), run_id.into());
        metadata.insert(meta::RUN_TYPE.into(), "c".into());
        metadata.insert(meta::DECK_ID.into(), "7".into());
        if ended {
            metadata.insert(meta::END_TIME.into(), now.to_string());
        }
        let mut claim = Claim::new_dungeon(&format!("player-{run_id}"), metadata, now - age_secs);
        claim.state = delve_state::ClaimState::Finalized;
        state.create_claim(&claim).unwrap();
        claim
    }

    fn event(state: &StateStore, name: &str, run_id: &str, run_type: Option<&str>) {
        let mut new = NewEvent::named(name).meta(meta::RUN_ID, run_id);
        if let Some(run_type) = run_type {
            new = new.meta(meta::RUN_TYPE, run_type);
        }
        state
            .put_event(&EventRecord::from_new(new, epoch_secs()))
            .unwrap();
    }

    fn job(state: &StateStore) -> BackfillJob {
        BackfillJob::new(state.clone(), BackfillConfig::default())
    }

    #[tokio::test]
    async fn merges_finished_run_onto_every_event_once() {
        let state = StateStore::open_in_memory().unwrap();
        claim(&state, "run-1", 7200, true);
        event(&state, "player-died", "run-1", Some("c"));
        event(&state, "game-won", "run-1", None);

        let report = job(&state).try_run().await.unwrap().unwrap();
        assert_eq!(report.merged_runs, 1);
        assert_eq!(report.updated_events, 2);

        for event in state.events_for_run("run-1").unwrap() {
            assert_eq!(event.metadata.get(meta::DECK_ID).map(String::as_str), Some("7"));
            assert_eq!(event.metadata.get(meta::RUN_TYPE).map(String::as_str), Some("c"));
        }

        let again = job(&state).try_run().await.unwrap().unwrap();
        assert_eq!(again, BackfillReport::default());
    }

    #[tokio::test]
    async fn young_unfinished_runs_wait() {
        let state = StateStore::open_in_memory().unwrap();
        claim(&state, "run-1", 60, false);
        claim(&state, "run-2", 60, true);
        event(&state, "game-won", "run-1", None);
        event(&state, "game-won", "run-2", None);

        let report = job(&state).try_run().await.unwrap().unwrap();
        assert_eq!(report.merged_runs, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(state.run_ids_missing_run_type(10).unwrap(), vec!["run-1".to_string()]);
    }

    #[tokio::test]
    async fn runs_without_claims_are_skipped() {
        let state = StateStore::open_in_memory().unwrap();
        event(&state, "game-won", "nobody", None);

        assert_eq!(
            backfill_run(&state, "nobody", epoch_secs(), 3600).unwrap(),
            RunOutcome::Orphaned
        );
        let report = job(&state).try_run().await.unwrap().unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn unmergeable_runs_do_not_starve_later_ones() {
        let state = StateStore::open_in_memory().unwrap();
        event(&state, "game-won", "nobody", None);
        claim(&state, "run-1", 60, false);
        event(&state, "game-won", "run-1", None);
        claim(&state, "run-2", 7200, true);
        event(&state, "game-won", "run-2", None);
        let job = BackfillJob::new(
            state.clone(),
            BackfillConfig {
                batch_limit: 1,
                ..BackfillConfig::default()
            },
        );

        let mut merged = 0;
        for _ in 0..3 {
            merged += job.try_run().await.unwrap().unwrap().merged_runs;
        }
        assert_eq!(merged, 1);
        let run_2 = state.events_for_run("run-2").unwrap();
        assert_eq!(run_2[0].metadata.get(meta::RUN_TYPE).map(String::as_str), Some("c"));

        // The cursor wrapped; the skipped runs come round again.
        let pending = state.run_ids_missing_run_type(10).unwrap();
        assert_eq!(pending, vec!["nobody".to_string(), "run-1".to_string()]);
        let report = job.try_run().await.unwrap().unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn concurrent_batches_are_refused() {
        let state = StateStore::open_in_memory().unwrap();
        let job = job(&state);
        job.running.store(true, Ordering::Release);

        assert!(job.try_run().await.unwrap().is_none());

        job.running.store(false, Ordering::Release);
        assert!(job.try_run().await.unwrap().is_some());
        assert!(!job.running.load(Ordering::Acquire));
    }
}
