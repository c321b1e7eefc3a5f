//! Register reconciler.
//!
//! Allocates an index for each live register and records it; releases the
//! index and drops the record once deletion is requested.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::ReconcileResult;
use crate::coordinator::AllocationCoordinator;
use crate::store::{RegisterRecord, RegistryStore};

/// Outcome of one register pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The register holds `index`. `changed` is set when the recorded index
    /// was updated.
    Allocated { index: u32, changed: bool },

    /// The index was released and the record removed.
    Released,
}

/// Reconciler for register records.
pub struct RegisterReconciler {
    coordinator: Arc<AllocationCoordinator>,
    store: Arc<dyn RegistryStore>,
}

impl RegisterReconciler {
    /// Create a new register reconciler.
    pub fn new(coordinator: Arc<AllocationCoordinator>, store: Arc<dyn RegistryStore>) -> Self {
        Self { coordinator, store }
    }

    /// Reconcile one register.
    #[instrument(skip(self, register), fields(register = %register.key))]
    pub fn reconcile(&self, register: &RegisterRecord) -> ReconcileResult<RegisterOutcome> {
        let request = register.to_request()?;

        if register.deleting {
            debug!(pool = %request.pool, "resource dealloc");
            self.coordinator.deregister(&request)?;
            self.store.remove_register(&register.key)?;
            info!(pool = %request.pool, "register released");
            return Ok(RegisterOutcome::Released);
        }

        debug!(pool = %request.pool, "resource alloc");
        let index = self.coordinator.register(&request)?;

        let changed = register.index != Some(index);
        if changed {
            self.store.set_register_index(&register.key, index)?;
            info!(pool = %request.pool, index, "register allocated");
        }

        Ok(RegisterOutcome::Allocated { index, changed })
    }
}
