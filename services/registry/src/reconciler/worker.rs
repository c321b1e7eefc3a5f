//! Reconcile background worker.
//!
//! Runs the register and registry reconcilers on a fixed tick. Registers
//! are visited on every tick. A registry is visited when its paced deadline
//! has passed or when a mutation reset its pace level.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nireg_id::PoolId;
use nireg_reconcile::{PaceLevel, PacePolicy};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{RegisterOutcome, RegisterReconciler, RegistryOutcome, RegistryReconciler};
use crate::coordinator::AllocationCoordinator;
use crate::store::RegistryStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between passes.
    pub tick_interval: Duration,

    /// Registry requeue delays.
    pub pace_policy: PacePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            pace_policy: PacePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    level: PaceLevel,
}

/// Next visit of each registry, carried between passes.
///
/// A registry is due once its deadline passes, or earlier if its pace level
/// dropped below the level recorded when it was scheduled.
#[derive(Debug, Default)]
pub struct Schedule {
    deadlines: HashMap<PoolId, Deadline>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline of a registry, if one is scheduled.
    pub fn deadline(&self, pool: &PoolId) -> Option<Instant> {
        self.deadlines.get(pool).map(|deadline| deadline.at)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    fn is_due(&self, pool: &PoolId, now: Instant, level: PaceLevel) -> bool {
        self.deadlines
            .get(pool)
            .is_none_or(|deadline| deadline.at <= now || level < deadline.level)
    }

    fn set(&mut self, pool: PoolId, at: Instant, level: PaceLevel) {
        self.deadlines.insert(pool, Deadline { at, level });
    }
}

/// Statistics from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub registers_allocated: u32,
    pub registers_released: u32,
    pub registers_failed: u32,
    pub registries_synced: u32,
    pub registries_blocked: u32,
    pub registries_deleted: u32,
    pub registries_failed: u32,
}

impl PassStats {
    /// Returns true if the pass changed any record.
    pub fn has_changes(&self) -> bool {
        self.registers_allocated > 0 || self.registers_released > 0 || self.registries_deleted > 0
    }
}

/// Worker that drives both reconcilers.
pub struct ReconcileWorker {
    coordinator: Arc<AllocationCoordinator>,
    store: Arc<dyn RegistryStore>,
    registries: RegistryReconciler,
    registers: RegisterReconciler,
    config: WorkerConfig,
}

impl ReconcileWorker {
    /// Create a new reconcile worker.
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        store: Arc<dyn RegistryStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registries: RegistryReconciler::new(
                coordinator.clone(),
                store.clone(),
                config.pace_policy.clone(),
            ),
            registers: RegisterReconciler::new(coordinator.clone(), store.clone()),
            coordinator,
            store,
            config,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Starting reconcile worker"
        );

        let mut schedule = Schedule::new();
        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.pass(&mut schedule, Instant::now());
                    if stats.has_changes() {
                        info!(
                            registers_allocated = stats.registers_allocated,
                            registers_released = stats.registers_released,
                            registries_synced = stats.registries_synced,
                            registries_deleted = stats.registries_deleted,
                            "Reconcile pass complete"
                        );
                    }
                    if stats.registers_failed > 0 || stats.registries_failed > 0 {
                        warn!(
                            registers_failed = stats.registers_failed,
                            registries_failed = stats.registries_failed,
                            "Reconcile pass had failures"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one pass at `now`.
    pub fn pass(&self, schedule: &mut Schedule, now: Instant) -> PassStats {
        let mut stats = PassStats::default();

        for register in self.store.registers() {
            match self.registers.reconcile(&register) {
                Ok(RegisterOutcome::Allocated { changed, .. }) => {
                    if changed {
                        stats.registers_allocated += 1;
                    }
                }
                Ok(RegisterOutcome::Released) => stats.registers_released += 1,
                Err(e) if e.is_retryable() => {
                    debug!(register = %register.key, error = %e, "Register not reconciled yet");
                    stats.registers_failed += 1;
                }
                Err(e) => {
                    error!(register = %register.key, error = %e, "Failed to reconcile register");
                    stats.registers_failed += 1;
                }
            }
        }

        let registries = self.store.registries();
        schedule
            .deadlines
            .retain(|pool, _| registries.contains(pool));

        for pool in registries {
            if !schedule.is_due(&pool, now, self.coordinator.pace_level(&pool)) {
                continue;
            }

            let next = match self.registries.reconcile(&pool) {
                Ok(RegistryOutcome::Synced { requeue_after, .. }) => {
                    stats.registries_synced += 1;
                    Some(now + requeue_after)
                }
                Ok(RegistryOutcome::Blocked { requeue_after, .. }) => {
                    stats.registries_blocked += 1;
                    Some(now + requeue_after)
                }
                Ok(RegistryOutcome::Deleted) => {
                    stats.registries_deleted += 1;
                    None
                }
                Err(e) => {
                    warn!(pool = %pool, error = %e, "Failed to reconcile registry");
                    stats.registries_failed += 1;
                    Some(now + self.config.pace_policy.short_wait)
                }
            };

            match next {
                Some(at) => {
                    let level = self.coordinator.pace_level(&pool);
                    schedule.set(pool, at, level);
                }
                None => {
                    schedule.deadlines.remove(&pool);
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use nireg_reconcile::ReconciliationPacer;

    use super::*;
    use crate::store::{InMemoryStore, RegisterKey, RegisterRecord, RegistrySpec, Selector};

    fn pool() -> PoolId {
        PoolId::new("default", "ni-registry").unwrap()
    }

    fn register(name: &str, key: &str) -> RegisterRecord {
        RegisterRecord {
            key: RegisterKey::new("default", name),
            registry: "ni-registry".to_string(),
            selector: Some(Selector::from([("name".to_string(), key.to_string())])),
            source_tag: None,
            deleting: false,
            index: None,
        }
    }

    fn setup() -> (Arc<InMemoryStore>, ReconcileWorker) {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_registry(pool(), RegistrySpec::with_size(4));
        let coordinator = Arc::new(AllocationCoordinator::new(store.clone()));
        let worker = ReconcileWorker::new(coordinator, store.clone(), WorkerConfig::default());
        (store, worker)
    }

    #[test]
    fn test_registers_wait_for_registry_init() {
        let (store, worker) = setup();
        store.upsert_register(register("reg-prov", "prov"));
        let mut due = Schedule::new();
        let now = Instant::now();

        // The pool is created by the registry pass, after registers ran.
        let first = worker.pass(&mut due, now);
        assert_eq!(first.registers_failed, 1);
        assert_eq!(first.registries_synced, 1);

        let second = worker.pass(&mut due, now);
        assert_eq!(second.registers_allocated, 1);
        // The allocation reset the pace level, so the registry is revisited
        // even though its deadline has not passed.
        assert_eq!(second.registries_synced, 1);

        let status = store.registry(&pool()).unwrap().status.unwrap();
        assert_eq!(status.allocated, 1);
        assert_eq!(status.used, vec!["prov".to_string()]);
    }

    #[test]
    fn test_live_register_does_not_force_resync() {
        let (store, worker) = setup();
        store.upsert_register(register("reg-prov", "prov"));
        let mut due = Schedule::new();
        let now = Instant::now();

        let synced: Vec<u32> = (0..10)
            .map(|_| worker.pass(&mut due, now).registries_synced)
            .collect();

        // Init, then the allocation. Re-registering the held key afterwards
        // changes nothing, so the deadline holds.
        assert_eq!(synced, vec![1, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            due.deadline(&pool()),
            Some(now + PacePolicy::default().very_short_wait)
        );
    }

    #[test]
    fn test_capped_pacer_honours_deadline() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_registry(pool(), RegistrySpec::with_size(4));
        let coordinator = Arc::new(
            AllocationCoordinator::new(store.clone())
                .with_pacer(ReconciliationPacer::with_max_level(0)),
        );
        let worker = ReconcileWorker::new(coordinator, store, WorkerConfig::default());
        let mut due = Schedule::new();
        let now = Instant::now();

        assert_eq!(worker.pass(&mut due, now).registries_synced, 1);
        assert_eq!(worker.pass(&mut due, now).registries_synced, 0);
        assert_eq!(
            due.deadline(&pool()),
            Some(now + PacePolicy::default().reconcile_interval)
        );
    }

    #[test]
    fn test_registry_respects_deadline() {
        let (_, worker) = setup();
        let mut due = Schedule::new();
        let now = Instant::now();

        assert_eq!(worker.pass(&mut due, now).registries_synced, 1);
        assert_eq!(worker.pass(&mut due, now).registries_synced, 0);

        let later = now + PacePolicy::default().very_short_wait;
        assert_eq!(worker.pass(&mut due, later).registries_synced, 1);
    }

    #[test]
    fn test_registry_deletion_flow() {
        let (store, worker) = setup();
        let record = register("reg-prov", "prov");
        store.upsert_register(record.clone());
        let mut due = Schedule::new();
        let now = Instant::now();
        worker.pass(&mut due, now);
        worker.pass(&mut due, now);

        store.mark_registry_deleting(&pool()).unwrap();
        let blocked = worker.pass(&mut due, now + Duration::from_secs(120));
        assert_eq!(blocked.registries_blocked, 1);

        store.mark_register_deleting(&record.key).unwrap();
        let released = worker.pass(&mut due, now + Duration::from_secs(120));
        assert_eq!(released.registers_released, 1);
        assert_eq!(released.registries_deleted, 1);
        assert!(store.registries().is_empty());
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, worker) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
