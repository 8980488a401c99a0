//! The control loop.
//!
//! One tick at a time: the next tick is scheduled only after the previous
//! one returned. Health checks and background jobs are spawned and never
//! awaited, so a slow probe or a long backfill cannot stall the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use delve_health::{BoxFuture, HealthMonitor};

use crate::admission::{AdmissionController, AdmissionReport};
use crate::cleanup::{CleanupReport, StaleRecordCleanup};
use crate::reconciler::ClaimReconciler;

/// Fire-and-forget job started once per tick.
pub type BackgroundJob = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub invalidated: usize,
    pub admission: AdmissionReport,
    pub health_checks: usize,
    pub cleanup: CleanupReport,
    pub background_jobs: usize,
}

#[derive(Clone)]
pub struct ControlLoop {
    reconciler: ClaimReconciler,
    admission: AdmissionController,
    health: HealthMonitor,
    cleanup: StaleRecordCleanup,
    jobs: Vec<BackgroundJob>,
    interval: Duration,
}

impl ControlLoop {
    pub fn new(
        reconciler: ClaimReconciler,
        admission: AdmissionController,
        health: HealthMonitor,
        cleanup: StaleRecordCleanup,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            admission,
            health,
            cleanup,
            jobs: Vec::new(),
            interval,
        }
    }

    pub fn with_background_job(mut self, job: BackgroundJob) -> Self {
        self.jobs.push(job);
        self
    }

    /// Run every stage once. A failing stage is logged and the remaining
    /// stages still run.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.reconciler.run().await {
            Ok(invalidated) => report.invalidated = invalidated,
            Err(e) => error!(error = %e, "claim reconciliation failed"),
        }

        match self.admission.run().await {
            Ok(admission) => report.admission = admission,
            Err(e) => error!(error = %e, "admission failed"),
        }

        match self.health.check_all() {
            Ok(handles) => report.health_checks = handles.len(),
            Err(e) => error!(error = %e, "failed to start health checks"),
        }

        match self.cleanup.run() {
            Ok(cleanup) => report.cleanup = cleanup,
            Err(e) => error!(error = %e, "stale record cleanup failed"),
        }

        for job in &self.jobs {
            tokio::spawn(job());
            report.background_jobs += 1;
        }

        debug!(?report, "tick complete");
        report
    }

    /// Tick, sleep for the interval, repeat until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "control loop started");

        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use crate::testing::*;
    use delve_core::epoch_secs;
    use delve_health::StaticProber;
    use delve_state::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tick_admits_and_spawns_jobs() {
        let ctx = context();
        let scheduler = Scheduler::new(ctx.clone(), Arc::new(StaticProber::new()));
        ctx.state.put_instance(&available("d001", "10.0.0.1")).unwrap();
        queued_player(&ctx.state, "alex", Metadata::new());

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let job: BackgroundJob = Arc::new(move || -> BoxFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let control = scheduler.control_loop().with_background_job(job);

        let report = control.tick().await;
        assert_eq!(report.admission.admitted, 1);
        assert_eq!(report.health_checks, 1);
        assert_eq!(report.background_jobs, 1);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn healthy_callback_expires_reservations() {
        let ctx = context();
        let scheduler = Scheduler::new(ctx.clone(), Arc::new(StaticProber::new()));
        let mut inst = available("d001", "10.0.0.1");
        inst.state = InstanceStatus::Reserved;
        inst.reserved_by = Some("alex".into());
        inst.reserved_at = Some(epoch_secs() - 600);
        ctx.state.put_instance(&inst).unwrap();

        for handle in scheduler.health.check_all().unwrap() {
            handle.await.unwrap();
        }

        let stored = ctx.state.get_instance("d001/10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceStatus::Rebuilding);
    }

    #[tokio::test]
    async fn eviction_callback_invalidates_claims() {
        let ctx = context();
        let prober = Arc::new(StaticProber::new());
        let scheduler = Scheduler::new(ctx.clone(), prober.clone());
        let claim = queued_player(&ctx.state, "alex", Metadata::new());
        ctx.state
            .update_claim(&claim.id, |c| {
                c.state = ClaimState::InUse;
                c.claimant = Some("d001".into());
            })
            .unwrap();
        let mut inst = available("d001", "10.0.0.1");
        inst.state = InstanceStatus::Unreachable;
        inst.unhealthy_since = Some(epoch_secs() - 400);
        ctx.state.put_instance(&inst).unwrap();
        prober.set_down("10.0.0.1");

        for handle in scheduler.health.check_all().unwrap() {
            handle.await.unwrap();
        }

        assert!(ctx.state.get_instance("d001/10.0.0.1").unwrap().is_none());
        let stored = ctx.state.get_claim(&claim.id).unwrap().unwrap();
        assert_eq!(stored.state, ClaimState::Invalid);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let ctx = context();
        let scheduler = Scheduler::new(ctx, Arc::new(StaticProber::new()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.control_loop().run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
