//! Registry reconciler.
//!
//! One pass over a registry record:
//! - A record marked for deletion is removed only once its pool is empty
//! - Otherwise the pool is initialized from the declared size, occupancy
//!   is written back as status, and the next pass is paced

use std::sync::Arc;
use std::time::Duration;

use nireg_id::PoolId;
use nireg_reconcile::PacePolicy;
use tracing::{debug, info, instrument};

use super::ReconcileResult;
use crate::coordinator::AllocationCoordinator;
use crate::store::{RegistryStatus, RegistryStore};

/// Outcome of one registry pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOutcome {
    /// Pool initialized and status written.
    Synced {
        status: RegistryStatus,
        requeue_after: Duration,
    },

    /// Deletion requested but indices are still allocated.
    Blocked {
        allocated: u32,
        requeue_after: Duration,
    },

    /// Pool and record removed.
    Deleted,
}

/// Reconciler for registry records.
pub struct RegistryReconciler {
    coordinator: Arc<AllocationCoordinator>,
    store: Arc<dyn RegistryStore>,
    policy: PacePolicy,
}

impl RegistryReconciler {
    /// Create a new registry reconciler.
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        store: Arc<dyn RegistryStore>,
        policy: PacePolicy,
    ) -> Self {
        Self {
            coordinator,
            store,
            policy,
        }
    }

    /// Reconcile one registry.
    #[instrument(skip(self, pool), fields(pool = %pool))]
    pub fn reconcile(&self, pool: &PoolId) -> ReconcileResult<RegistryOutcome> {
        let record = self.store.registry(pool)?;

        if record.deleting {
            return self.finalize_delete(pool);
        }

        self.coordinator.init_from_store(pool)?;

        let status = self.coordinator.status(pool);
        debug!(
            allocated = status.allocated,
            available = status.available,
            "registry status"
        );
        if record.status.as_ref() != Some(&status) {
            self.store.set_registry_status(pool, status.clone())?;
        }

        let requeue_after = self.coordinator.next_delay(pool, &self.policy);
        Ok(RegistryOutcome::Synced {
            status,
            requeue_after,
        })
    }

    fn finalize_delete(&self, pool: &PoolId) -> ReconcileResult<RegistryOutcome> {
        let allocated = self.coordinator.get_allocated(pool).allocated;
        if allocated > 0 {
            debug!(allocated, "registry deletion waiting for releases");
            return Ok(RegistryOutcome::Blocked {
                allocated,
                requeue_after: self.coordinator.next_delay(pool, &self.policy),
            });
        }

        self.coordinator.delete(pool);
        self.store.remove_registry(pool)?;
        info!("registry deleted");
        Ok(RegistryOutcome::Deleted)
    }
}
