//! Retention purge for high-volume records.

use tracing::{debug, info};

use delve_core::epoch_secs;
use delve_state::StateStore;

use crate::error::SchedulerResult;

/// Event names that are pure liveness noise once old.
pub const PURGED_EVENTS: &[&str] = &["server-online", "server-closing", "player-seen"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub events: usize,
    pub locks: usize,
    pub tasks: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.events + self.locks + self.tasks
    }
}

#[derive(Clone)]
pub struct StaleRecordCleanup {
    state: StateStore,
    retention_secs: u64,
}

impl StaleRecordCleanup {
    pub fn new(state: StateStore, retention_secs: u64) -> Self {
        Self {
            state,
            retention_secs,
        }
    }

    /// Delete liveness events, locks and tasks older than the retention
    /// window. Everything else is kept indefinitely.
    pub fn run(&self) -> SchedulerResult<CleanupReport> {
        let cutoff = epoch_secs().saturating_sub(self.retention_secs);
        let report = CleanupReport {
            events: self.state.purge_events_before(PURGED_EVENTS, cutoff)?,
            locks: self.state.purge_locks_before(cutoff)?,
            tasks: self.state.purge_tasks_before(cutoff)?,
        };
        if report.total() > 0 {
            info!(
                events = report.events,
                locks = report.locks,
                tasks = report.tasks,
                "stale records purged"
            );
        } else {
            debug!("no stale records");
        }
        Ok(report)
    }
}
