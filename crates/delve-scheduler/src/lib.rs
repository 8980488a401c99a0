//! delve-scheduler — the dungeon pool control plane.
//!
//! Matches queued players to healthy pool instances, expires reservations
//! nobody used, tears down idle dungeons and reconciles claims that drifted
//! away from the player or instance records they depend on.
//!
//! # Architecture
//!
//! ```text
//! ControlLoop::tick (one at a time)
//!   ├── ClaimReconciler::run      stale claims → invalidate / finalize
//!   ├── AdmissionController::run  queued players → reserve, probe, dispatch
//!   ├── HealthMonitor::check_all  spawned, not awaited
//!   │     ├── healthy → LeaseManager (reservation expiry, idle teardown)
//!   │     └── evicted → ClaimLedger::release_instance_claims
//!   ├── StaleRecordCleanup::run   retention purge
//!   └── background jobs           spawned (metadata backfill)
//! ```

pub mod admission;
pub mod claims;
pub mod cleanup;
pub mod error;
pub mod lease;
pub mod reconciler;
pub mod worker;

use std::sync::Arc;

use delve_core::{DelveConfig, PoolMatcher};
use delve_health::{BoxFuture, EvictionCallback, HealthMonitor, HealthyCallback, Prober};
use delve_lock::SharedLocker;
use delve_notify::{CommandQueue, SharedNotifier};
use delve_state::{DungeonInstance, StateStore};

pub use admission::{AdmissionController, AdmissionReport};
pub use claims::{AbandonedRunFinalizer, ClaimLedger, RunFinalizer};
pub use cleanup::{CleanupReport, StaleRecordCleanup};
pub use error::{SchedulerError, SchedulerResult};
pub use lease::LeaseManager;
pub use reconciler::{ClaimReconciler, Verdict};
pub use worker::{BackgroundJob, ControlLoop, TickReport};

/// Handles every scheduler component shares.
#[derive(Clone)]
pub struct SchedulerContext {
    pub state: StateStore,
    pub config: Arc<DelveConfig>,
    pub pool: PoolMatcher,
    pub commands: CommandQueue,
    pub notifier: SharedNotifier,
    pub locker: SharedLocker,
}

impl SchedulerContext {
    pub fn new(
        state: StateStore,
        config: Arc<DelveConfig>,
        pool: PoolMatcher,
        notifier: SharedNotifier,
        locker: SharedLocker,
    ) -> Self {
        Self {
            commands: CommandQueue::new(state.clone()),
            state,
            config,
            pool,
            notifier,
            locker,
        }
    }

    /// Operator notification. Failures are logged, never propagated.
    pub(crate) async fn notify_ops(&self, text: &str) {
        if let Err(e) = self.notifier.ops(text).await {
            tracing::warn!(error = %e, "ops notification failed");
        }
    }
}

/// All scheduler components, wired together.
#[derive(Clone)]
pub struct Scheduler {
    pub ledger: ClaimLedger,
    pub lease: LeaseManager,
    pub health: HealthMonitor,
    pub admission: AdmissionController,
    pub reconciler: ClaimReconciler,
    pub cleanup: StaleRecordCleanup,
    interval: std::time::Duration,
}

impl Scheduler {
    /// Build every component and hook the lease manager and claim ledger
    /// into the health monitor's callbacks.
    pub fn new(ctx: SchedulerContext, prober: Arc<dyn Prober>) -> Self {
        let ledger = ClaimLedger::new(ctx.clone())
            .with_finalizer(Arc::new(AbandonedRunFinalizer::new(ctx.state.clone())));
        let lease = LeaseManager::new(ctx.clone(), ledger.clone());

        let healthy_lease = lease.clone();
        let on_healthy: HealthyCallback = Arc::new(move |instance: DungeonInstance| -> BoxFuture {
            let lease = healthy_lease.clone();
            Box::pin(async move { lease.on_healthy(instance).await })
        });
        let evicted_ledger = ledger.clone();
        let on_evicted: EvictionCallback = Arc::new(move |instance: DungeonInstance| -> BoxFuture {
            let ledger = evicted_ledger.clone();
            Box::pin(async move { ledger.on_evicted(instance).await })
        });

        let health = HealthMonitor::new(
            ctx.state.clone(),
            prober,
            ctx.notifier.clone(),
            &ctx.config,
        )
        .with_healthy_callback(on_healthy)
        .with_eviction_callback(on_evicted);

        let admission = AdmissionController::new(ctx.clone(), health.clone());
        let reconciler = ClaimReconciler::new(ctx.clone(), ledger.clone(), lease.clone());
        let cleanup = StaleRecordCleanup::new(ctx.state.clone(), ctx.config.cleanup_retention_secs);

        Self {
            ledger,
            lease,
            health,
            admission,
            reconciler,
            cleanup,
            interval: ctx.config.tick_interval(),
        }
    }

    pub fn control_loop(&self) -> ControlLoop {
        ControlLoop::new(
            self.reconciler.clone(),
            self.admission.clone(),
            self.health.clone(),
            self.cleanup.clone(),
            self.interval,
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use delve_core::epoch_secs;
    use delve_lock::StoreLocker;
    use delve_notify::CommandQueueNotifier;
    use delve_state::*;

    pub fn context() -> SchedulerContext {
        context_with(DelveConfig::default())
    }

    pub fn context_with(config: DelveConfig) -> SchedulerContext {
        let state = StateStore::open_in_memory().unwrap();
        let pool = PoolMatcher::new(&config.pool_pattern).unwrap();
        let notifier: SharedNotifier = Arc::new(CommandQueueNotifier::new(
            CommandQueue::new(state.clone()),
            &config.lobby_server,
        ));
        SchedulerContext::new(
            state.clone(),
            Arc::new(config),
            pool,
            notifier,
            StoreLocker::shared(state),
        )
    }

    /// A healthy, available pool instance that passed the debounce window.
    pub fn available(name: &str, address: &str) -> DungeonInstance {
        let now = epoch_secs();
        let mut inst = DungeonInstance::new(name, address, now - 600);
        inst.state = InstanceStatus::Available;
        inst.healthy_since = Some(now - 120);
        inst
    }

    /// A queued, allowed player holding a fresh pending claim.
    pub fn queued_player(state: &StateStore, name: &str, metadata: Metadata) -> Claim {
        let now = epoch_secs();
        let claim = Claim::new_dungeon(name, metadata, now);
        state.create_claim(&claim).unwrap();
        let mut player = Player::new(name, "lobby", now);
        player.state = PlayerState::InQueue;
        player.allowed_to_play = true;
        player.queued_at = Some(now);
        player.active_claim_id = Some(claim.id.clone());
        state.put_player(&player).unwrap();
        claim
    }

    pub fn commands(state: &StateStore, command: CommandType) -> Vec<Task> {
        state
            .list_tasks()
            .unwrap()
            .into_iter()
            .filter(|t| t.command == command)
            .collect()
    }
}
