//! Declarative state the engine consults and reports into.
//!
//! The engine never owns the source of truth for registries and registers;
//! it asks a [`RegistryStore`] whether a pool is declared, how large it is
//! and whether it is ready, and writes occupancy back as status.

mod memory;
mod model;

pub use memory::{InMemoryStore, ManifestError};
pub use model::{
    AdminState, RegisterKey, RegisterRecord, RegistryRecord, RegistrySpec, RegistryStatus,
    Selector,
};

use nireg_alloc::AllocationStrategy;
use nireg_id::PoolId;
use thiserror::Error;

/// Store lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No registry record for the pool.
    #[error("registry not found: {0}")]
    RegistryNotFound(PoolId),

    /// No register record with this key.
    #[error("register not found: {0}")]
    RegisterNotFound(RegisterKey),

    /// The registry record does not declare a size.
    #[error("registry {0} does not declare a size")]
    MissingSize(PoolId),
}

/// Declarative-state collaborator.
pub trait RegistryStore: Send + Sync {
    /// Fetch a registry record.
    fn registry(&self, pool: &PoolId) -> Result<RegistryRecord, StoreError>;

    /// All declared registries.
    fn registries(&self) -> Vec<PoolId>;

    /// Mirror engine occupancy into a registry record.
    fn set_registry_status(&self, pool: &PoolId, status: RegistryStatus)
        -> Result<(), StoreError>;

    /// Drop a registry record once its deletion has completed.
    fn remove_registry(&self, pool: &PoolId) -> Result<(), StoreError>;

    /// All declared registers.
    fn registers(&self) -> Vec<RegisterRecord>;

    /// Record the index allocated for a register.
    fn set_register_index(&self, key: &RegisterKey, index: u32) -> Result<(), StoreError>;

    /// Drop a register record once its release has completed.
    fn remove_register(&self, key: &RegisterKey) -> Result<(), StoreError>;

    /// Declared pool size.
    fn get_size(&self, pool: &PoolId) -> Result<u32, StoreError> {
        self.registry(pool)?
            .spec
            .size
            .ok_or_else(|| StoreError::MissingSize(pool.clone()))
    }

    /// Whether the registry may serve allocations.
    fn is_ready(&self, pool: &PoolId) -> Result<bool, StoreError> {
        let record = self.registry(pool)?;
        Ok(record.ready && record.spec.is_enabled())
    }

    /// Declared placement strategy.
    fn allocation_strategy(&self, pool: &PoolId) -> Result<AllocationStrategy, StoreError> {
        Ok(self
            .registry(pool)?
            .spec
            .allocation_strategy
            .unwrap_or_default())
    }
}
