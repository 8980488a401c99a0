//! Process assembly for the Delve daemon.
//!
//! Wires the state store, notifiers, scheduler, event reactor and backfill
//! job into one [`Daemon`]. The binary adds CLI parsing, logging and the
//! HTTP listener on top.

use std::sync::Arc;

use axum::Router;
use tracing::{info, warn};

use delve_api::{ApiState, build_router};
use delve_backfill::BackfillJob;
use delve_core::{DelveConfig, PoolMatcher};
use delve_health::{BoxFuture, Prober};
use delve_lock::StoreLocker;
use delve_notify::{CommandQueue, CommandQueueNotifier, Notifiers, SharedNotifier, WebhookNotifier};
use delve_reactor::EventReactor;
use delve_scheduler::{BackgroundJob, ControlLoop, Scheduler, SchedulerContext};
use delve_state::StateStore;

#[derive(Clone)]
pub struct Daemon {
    pub state: StateStore,
    pub scheduler: Scheduler,
    pub reactor: EventReactor,
    pub backfill: BackfillJob,
}

impl Daemon {
    pub fn assemble(state: StateStore, config: DelveConfig, prober: Arc<dyn Prober>) -> anyhow::Result<Self> {
        let pool = PoolMatcher::new(&config.pool_pattern)?;
        let notifier = build_notifier(&state, &config)?;
        let locker = StoreLocker::shared(state.clone());
        let backfill = BackfillJob::new(state.clone(), config.backfill.clone());
        let ctx = SchedulerContext::new(state.clone(), Arc::new(config), pool, notifier, locker);

        let scheduler = Scheduler::new(ctx.clone(), prober);
        let reactor = EventReactor::new(ctx, scheduler.ledger.clone());
        Ok(Self {
            state,
            scheduler,
            reactor,
            backfill,
        })
    }

    pub fn router(&self) -> Router {
        build_router(ApiState {
            store: self.state.clone(),
            reactor: self.reactor.clone(),
        })
    }

    /// The scheduler's control loop with metadata backfill attached.
    pub fn control_loop(&self) -> ControlLoop {
        self.scheduler
            .control_loop()
            .with_background_job(backfill_job(self.backfill.clone()))
    }
}

/// Operator messages always go to the lobby; a webhook is added when
/// configured.
fn build_notifier(state: &StateStore, config: &DelveConfig) -> anyhow::Result<SharedNotifier> {
    let mut notifiers = Notifiers::new().with(Arc::new(CommandQueueNotifier::new(
        CommandQueue::new(state.clone()),
        &config.lobby_server,
    )));
    if let Some(ref url) = config.webhook_url {
        notifiers = notifiers.with(Arc::new(WebhookNotifier::new(url)?));
        info!("webhook notifications enabled");
    }
    Ok(Arc::new(notifiers))
}

fn backfill_job(job: BackfillJob) -> BackgroundJob {
    Arc::new(move || -> BoxFuture {
        let job = job.clone();
        Box::pin(async move {
            if let Err(e) = job.try_run().await {
                warn!(error = %e, "metadata backfill failed");
            }
        })
    })
}
