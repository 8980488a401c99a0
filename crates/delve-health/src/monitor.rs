//! Health monitor — probes every instance and reacts to the result.
//!
//! A reachable instance is marked healthy and handed to the healthy
//! callback, which the scheduler uses for lease expiry and idle teardown.
//! An unreachable one is degraded, and evicted once it has been unhealthy
//! for longer than the eviction grace window.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use delve_core::{DelveConfig, epoch_secs};
use delve_notify::SharedNotifier;
use delve_state::*;

use crate::checker::{ProbeResult, Prober, probe_with_retries};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked with the current record after a successful probe.
pub type HealthyCallback = Arc<dyn Fn(DungeonInstance) -> BoxFuture + Send + Sync>;

/// Invoked with the last known record after an instance is evicted.
pub type EvictionCallback = Arc<dyn Fn(DungeonInstance) -> BoxFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeOutcome {
    MarkedUnreachable { unhealthy_since: u64 },
    Evicted,
    /// The record was already gone.
    Missing,
    /// The record changed after the probe was taken; nothing was written.
    Superseded,
}

#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    prober: Arc<dyn Prober>,
    notifier: SharedNotifier,
    attempts: u32,
    eviction_grace_secs: u64,
    /// Bounds concurrent probe chains.
    permits: Arc<Semaphore>,
    on_healthy: Option<HealthyCallback>,
    on_evicted: Option<EvictionCallback>,
}

impl HealthMonitor {
    pub fn new(
        state: StateStore,
        prober: Arc<dyn Prober>,
        notifier: SharedNotifier,
        config: &DelveConfig,
    ) -> Self {
        Self {
            state,
            prober,
            notifier,
            attempts: config.probe.attempts,
            eviction_grace_secs: config.eviction_grace_secs,
            permits: Arc::new(Semaphore::new(config.probe.max_concurrent.max(1))),
            on_healthy: None,
            on_evicted: None,
        }
    }

    pub fn with_healthy_callback(mut self, callback: HealthyCallback) -> Self {
        self.on_healthy = Some(callback);
        self
    }

    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evicted = Some(callback);
        self
    }

    /// Probe an address with the configured retry bound.
    pub async fn probe(&self, address: &str) -> ProbeResult {
        probe_with_retries(self.prober.as_ref(), address, self.attempts).await
    }

    /// Spawn one probe chain per known instance and return without waiting.
    ///
    /// The handles are returned so tests can join them; the control loop
    /// drops them.
    pub fn check_all(&self) -> StateResult<Vec<JoinHandle<()>>> {
        let instances = self.state.list_instances()?;
        debug!(count = instances.len(), "spawning health checks");
        Ok(instances
            .into_iter()
            .map(|instance| {
                let monitor = self.clone();
                tokio::spawn(async move { monitor.check_instance(instance).await })
            })
            .collect())
    }

    /// Probe one instance and run the healthy or degrade chain.
    pub async fn check_instance(&self, instance: DungeonInstance) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        match self.probe(&instance.address).await {
            ProbeResult::Reachable => match self.mark_healthy(&instance).await {
                Ok(Some(current)) => {
                    if let Some(ref cb) = self.on_healthy {
                        cb(current).await;
                    }
                }
                Ok(None) => debug!(name = %instance.name, "instance vanished during health check"),
                Err(e) => error!(name = %instance.name, error = %e, "failed to mark instance healthy"),
            },
            ProbeResult::Unreachable => {
                if let Err(e) = self.degrade(&instance).await {
                    error!(name = %instance.name, error = %e, "failed to degrade instance");
                }
            }
        }
    }

    /// Bring an unreachable instance back to `available`.
    ///
    /// Instances in any other state are left alone. Returns the current
    /// record, or `None` if it no longer exists.
    pub async fn mark_healthy(&self, instance: &DungeonInstance) -> StateResult<Option<DungeonInstance>> {
        let key = instance.table_key();
        let now = epoch_secs();
        let recovered = self
            .state
            .compare_and_swap_instance(&key, InstanceStatus::Unreachable, |i| {
                i.state = InstanceStatus::Available;
                i.unhealthy_since = None;
                i.healthy_since = Some(now);
                i.clear_reservation();
                i.updated_at = now;
            })?;

        if let Some(current) = recovered {
            let message = format!(
                "Dungeon instance {} at {} is now healthy",
                current.name, current.address
            );
            info!(name = %current.name, address = %current.address, "instance recovered");
            if let Err(e) = self.notifier.ops(&message).await {
                warn!(error = %e, "failed to notify ops of recovery");
            }
            return Ok(Some(current));
        }

        self.state.get_instance(&key)
    }

    /// Record a failed probe against the `instance` snapshot it was taken
    /// for.
    ///
    /// Within the grace window the instance becomes `unreachable` and keeps
    /// the first `unhealthy_since` it was given. Past the window the record
    /// is deleted and the eviction callback runs. Both writes only go ahead
    /// while the stored state and `unhealthy_since` still match the snapshot.
    pub async fn degrade(&self, instance: &DungeonInstance) -> StateResult<DegradeOutcome> {
        let key = instance.table_key();
        let now = epoch_secs();
        let Some(current) = self.state.get_instance(&key)? else {
            return Ok(DegradeOutcome::Missing);
        };
        let unchanged = |i: &DungeonInstance| {
            i.state == instance.state && i.unhealthy_since == instance.unhealthy_since
        };
        if !unchanged(&current) {
            info!(name = %current.name, address = %current.address, "instance changed since probe, not degrading");
            return Ok(DegradeOutcome::Superseded);
        }

        let expired = current
            .unhealthy_since
            .is_some_and(|since| since.saturating_add(self.eviction_grace_secs) <= now);
        if expired {
            let Some(evicted) = self.state.delete_instance_if(&key, |i| unchanged(i))? else {
                info!(name = %current.name, address = %current.address, "lost race evicting instance");
                return Ok(DegradeOutcome::Superseded);
            };
            warn!(
                name = %evicted.name,
                address = %evicted.address,
                grace_secs = self.eviction_grace_secs,
                "instance unhealthy past grace window, removed it from the pool"
            );
            let message = format!(
                "Dungeon {} at {} has been unreachable for over {} seconds and was removed from the pool",
                evicted.name, evicted.address, self.eviction_grace_secs
            );
            if let Err(e) = self.notifier.ops(&message).await {
                warn!(error = %e, "failed to notify ops of eviction");
            }
            if let Some(ref cb) = self.on_evicted {
                cb(evicted).await;
            }
            return Ok(DegradeOutcome::Evicted);
        }

        let marked = self.state.update_instance(&key, |i| {
            if !unchanged(i) {
                return false;
            }
            i.state = InstanceStatus::Unreachable;
            i.unhealthy_since.get_or_insert(now);
            i.healthy_since = None;
            i.updated_at = now;
            true
        })?;

        match marked {
            Some(i) => {
                let unhealthy_since = i.unhealthy_since.unwrap_or(now);
                warn!(name = %i.name, address = %i.address, unhealthy_since, "instance marked unreachable");
                Ok(DegradeOutcome::MarkedUnreachable { unhealthy_since })
            }
            None => {
                info!(name = %current.name, address = %current.address, "lost race marking instance unreachable");
                Ok(DegradeOutcome::Superseded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::StaticProber;
    use delve_notify::{CommandQueue, CommandQueueNotifier};
    use std::sync::Mutex;

    struct Fixture {
        state: StateStore,
        prober: Arc<StaticProber>,
        monitor: HealthMonitor,
    }

    fn fixture() -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let prober = Arc::new(StaticProber::new());
        let notifier: SharedNotifier = Arc::new(CommandQueueNotifier::new(
            CommandQueue::new(state.clone()),
            "lobby",
        ));
        let monitor = HealthMonitor::new(state.clone(), prober.clone(), notifier, &DelveConfig::default());
        Fixture {
            state,
            prober,
            monitor,
        }
    }

    fn instance(state: InstanceStatus, unhealthy_since: Option<u64>) -> DungeonInstance {
        let mut inst = DungeonInstance::new("d001", "10.0.0.1", 1000);
        inst.state = state;
        inst.unhealthy_since = unhealthy_since;
        inst
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, EvictionCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: EvictionCallback = Arc::new(move |inst: DungeonInstance| -> BoxFuture {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(inst.name);
            })
        });
        (seen, cb)
    }

    #[tokio::test]
    async fn mark_healthy_recovers_unreachable_instance() {
        let f = fixture();
        let mut inst = instance(InstanceStatus::Unreachable, Some(epoch_secs() - 30));
        inst.reserved_by = Some("alex".into());
        f.state.put_instance(&inst).unwrap();

        let current = f.monitor.mark_healthy(&inst).await.unwrap().unwrap();

        assert_eq!(current.state, InstanceStatus::Available);
        assert!(current.unhealthy_since.is_none());
        assert!(current.healthy_since.is_some());
        assert!(current.reserved_by.is_none());
        let ops = f.state.tasks_for_server("lobby").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].command, CommandType::MessageOps);
    }

    #[tokio::test]
    async fn mark_healthy_ignores_other_states() {
        let f = fixture();
        let inst = instance(InstanceStatus::InUse, None);
        f.state.put_instance(&inst).unwrap();

        let current = f.monitor.mark_healthy(&inst).await.unwrap().unwrap();
        assert_eq!(current.state, InstanceStatus::InUse);
        assert!(f.state.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_degrade_marks_unreachable() {
        let f = fixture();
        let mut inst = instance(InstanceStatus::Available, None);
        inst.healthy_since = Some(900);
        f.state.put_instance(&inst).unwrap();

        let outcome = f.monitor.degrade(&inst).await.unwrap();
        assert!(matches!(outcome, DegradeOutcome::MarkedUnreachable { .. }));

        let stored = f.state.get_instance("d001/10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceStatus::Unreachable);
        assert!(stored.unhealthy_since.is_some());
        assert!(stored.healthy_since.is_none());
    }

    #[tokio::test]
    async fn repeated_degrade_keeps_first_unhealthy_since() {
        let f = fixture();
        let first_seen = epoch_secs() - 60;
        let inst = instance(InstanceStatus::Unreachable, Some(first_seen));
        f.state.put_instance(&inst).unwrap();

        for _ in 0..3 {
            let outcome = f.monitor.degrade(&inst).await.unwrap();
            assert_eq!(
                outcome,
                DegradeOutcome::MarkedUnreachable {
                    unhealthy_since: first_seen
                }
            );
        }
        let stored = f.state.get_instance("d001/10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.unhealthy_since, Some(first_seen));
    }

    #[tokio::test]
    async fn degrade_past_grace_evicts_and_calls_back() {
        let f = fixture();
        let (evicted, cb) = recorder();
        let monitor = f.monitor.clone().with_eviction_callback(cb);
        let inst = instance(InstanceStatus::Unreachable, Some(epoch_secs() - 301));
        f.state.put_instance(&inst).unwrap();

        let outcome = monitor.degrade(&inst).await.unwrap();

        assert_eq!(outcome, DegradeOutcome::Evicted);
        assert!(f.state.get_instance("d001/10.0.0.1").unwrap().is_none());
        assert_eq!(*evicted.lock().unwrap(), vec!["d001".to_string()]);
    }

    #[tokio::test]
    async fn degrade_leaves_instance_that_recovered_since_probe() {
        let f = fixture();
        let (evicted, cb) = recorder();
        let monitor = f.monitor.clone().with_eviction_callback(cb);
        let probed = instance(InstanceStatus::Unreachable, Some(epoch_secs() - 301));
        let mut ready = probed.clone();
        ready.state = InstanceStatus::Available;
        ready.unhealthy_since = None;
        ready.healthy_since = Some(epoch_secs());
        f.state.put_instance(&ready).unwrap();

        assert_eq!(monitor.degrade(&probed).await.unwrap(), DegradeOutcome::Superseded);

        let stored = f.state.get_instance("d001/10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceStatus::Available);
        assert!(stored.unhealthy_since.is_none());
        assert!(evicted.lock().unwrap().is_empty());
        assert!(f.state.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn degrade_skips_reregistered_instance() {
        let f = fixture();
        let probed = instance(InstanceStatus::Available, None);
        f.state
            .put_instance(&instance(InstanceStatus::Starting, None))
            .unwrap();

        assert_eq!(f.monitor.degrade(&probed).await.unwrap(), DegradeOutcome::Superseded);
        let stored = f.state.get_instance("d001/10.0.0.1").unwrap().unwrap();
        assert_eq!(stored.state, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn degrade_missing_instance() {
        let f = fixture();
        let inst = instance(InstanceStatus::Available, None);
        assert_eq!(f.monitor.degrade(&inst).await.unwrap(), DegradeOutcome::Missing);
    }

    #[tokio::test]
    async fn check_all_runs_both_chains() {
        let f = fixture();
        let (healthy, cb) = recorder();
        let monitor = f.monitor.clone().with_healthy_callback(cb);

        f.state.put_instance(&instance(InstanceStatus::Available, None)).unwrap();
        let mut dead = DungeonInstance::new("d002", "10.0.0.2", 1000);
        dead.state = InstanceStatus::Available;
        f.state.put_instance(&dead).unwrap();
        f.prober.set_down("10.0.0.2");

        for handle in monitor.check_all().unwrap() {
            handle.await.unwrap();
        }

        assert_eq!(*healthy.lock().unwrap(), vec!["d001".to_string()]);
        let dead = f.state.get_instance("d002/10.0.0.2").unwrap().unwrap();
        assert_eq!(dead.state, InstanceStatus::Unreachable);
        // 1 probe for the healthy one, 3 attempts for the dead one.
        assert_eq!(f.prober.calls(), 4);
    }
}
