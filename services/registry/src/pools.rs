//! Live slot tables, one per pool.
//!
//! The map lock is held only to look up, create or drop a table. Each table
//! has its own lock, so operations on different pools never wait on each
//! other. A handle fetched before a delete may outlive the map entry; the
//! table is marked retired so such a handle can tell it is stale.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use nireg_alloc::{AllocError, AllocSnapshot, AllocationStrategy, Allocator};
use nireg_id::PoolId;
use parking_lot::Mutex;

/// One pool's slot table.
#[derive(Debug)]
pub struct PoolTable {
    allocator: Allocator,
    retired: bool,
}

impl PoolTable {
    fn new(allocator: Allocator) -> Self {
        Self {
            allocator,
            retired: false,
        }
    }

    /// Returns true once the pool has been deleted from the registry.
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

impl Deref for PoolTable {
    type Target = Allocator;

    fn deref(&self) -> &Allocator {
        &self.allocator
    }
}

impl DerefMut for PoolTable {
    fn deref_mut(&mut self) -> &mut Allocator {
        &mut self.allocator
    }
}

/// Shared handle to one pool's table.
pub type PoolHandle = Arc<Mutex<PoolTable>>;

/// Owner of all live pools.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolId, PoolHandle>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pool if it does not exist yet.
    ///
    /// Returns `true` if a table was created. An existing pool keeps its
    /// original capacity and strategy.
    pub fn init_pool(
        &self,
        pool: &PoolId,
        capacity: u32,
        strategy: AllocationStrategy,
    ) -> Result<bool, AllocError> {
        let mut pools = self.pools.lock();
        if pools.contains_key(pool) {
            return Ok(false);
        }

        let allocator = Allocator::with_strategy(capacity, strategy)?;
        pools.insert(pool.clone(), Arc::new(Mutex::new(PoolTable::new(allocator))));
        Ok(true)
    }

    /// Drop a pool and every allocation in it.
    ///
    /// Returns `true` if the pool existed. Outstanding handles see the table
    /// as retired.
    pub fn delete_pool(&self, pool: &PoolId) -> bool {
        // Release the map lock before taking the pool lock.
        let Some(handle) = self.pools.lock().remove(pool) else {
            return false;
        };
        handle.lock().retired = true;
        true
    }

    /// Handle to a pool's table.
    pub fn get(&self, pool: &PoolId) -> Option<PoolHandle> {
        self.pools.lock().get(pool).cloned()
    }

    /// Occupancy of a pool; empty if the pool does not exist.
    pub fn get_allocated(&self, pool: &PoolId) -> AllocSnapshot {
        // Release the map lock before taking the pool lock.
        let Some(handle) = self.get(pool) else {
            return AllocSnapshot::default();
        };
        let snapshot = handle.lock().snapshot();
        snapshot
    }

    /// Capacity of a pool, if it exists.
    pub fn capacity(&self, pool: &PoolId) -> Option<u32> {
        let handle = self.get(pool)?;
        let capacity = handle.lock().capacity();
        Some(capacity)
    }

    /// Returns true if the pool exists.
    pub fn contains(&self, pool: &PoolId) -> bool {
        self.pools.lock().contains_key(pool)
    }

    /// Identities of all live pools.
    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.lock().keys().cloned().collect()
    }

    /// Number of live pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Returns true if no pool exists.
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> PoolId {
        PoolId::new("default", name).unwrap()
    }

    #[test]
    fn test_init_is_idempotent() {
        let registry = PoolRegistry::new();
        let p = pool("ni");

        assert!(registry.init_pool(&p, 4, AllocationStrategy::Hash).unwrap());
        assert!(!registry.init_pool(&p, 100, AllocationStrategy::Hash).unwrap());

        // Capacity is fixed at creation.
        assert_eq!(registry.capacity(&p), Some(4));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_init_rejects_zero_capacity() {
        let registry = PoolRegistry::new();
        assert_eq!(
            registry
                .init_pool(&pool("ni"), 0, AllocationStrategy::Hash)
                .unwrap_err(),
            AllocError::ZeroCapacity
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_pool_reports_empty() {
        let registry = PoolRegistry::new();
        let snapshot = registry.get_allocated(&pool("missing"));
        assert_eq!(snapshot.allocated, 0);
        assert!(snapshot.used.is_empty());
        assert_eq!(registry.capacity(&pool("missing")), None);
    }

    #[test]
    fn test_delete_discards_allocations() {
        let registry = PoolRegistry::new();
        let p = pool("ni");
        registry.init_pool(&p, 4, AllocationStrategy::Hash).unwrap();
        registry
            .get(&p)
            .unwrap()
            .lock()
            .insert("prov", "reg", None)
            .unwrap();
        assert_eq!(registry.get_allocated(&p).allocated, 1);

        assert!(registry.delete_pool(&p));
        assert!(!registry.delete_pool(&p));
        assert!(!registry.contains(&p));
        assert_eq!(registry.get_allocated(&p).allocated, 0);
    }

    #[test]
    fn test_delete_retires_outstanding_handle() {
        let registry = PoolRegistry::new();
        let p = pool("ni");
        registry.init_pool(&p, 4, AllocationStrategy::Hash).unwrap();
        let stale = registry.get(&p).unwrap();
        assert!(!stale.lock().is_retired());

        registry.delete_pool(&p);
        assert!(stale.lock().is_retired());

        // A new pool under the same identity gets a fresh table.
        registry.init_pool(&p, 4, AllocationStrategy::Hash).unwrap();
        assert!(!registry.get(&p).unwrap().lock().is_retired());
    }

    #[test]
    fn test_pools_are_independent() {
        let registry = PoolRegistry::new();
        let a = pool("a");
        let b = pool("b");
        registry.init_pool(&a, 1, AllocationStrategy::Hash).unwrap();
        registry.init_pool(&b, 1, AllocationStrategy::Hash).unwrap();

        // Holding one pool's lock does not block another pool.
        let held = registry.get(&a).unwrap();
        let _guard = held.lock();
        registry
            .get(&b)
            .unwrap()
            .lock()
            .insert("prov", "reg", None)
            .unwrap();
        assert_eq!(registry.get_allocated(&b).allocated, 1);

        let mut ids = registry.pool_ids();
        ids.sort();
        assert_eq!(ids, vec![a, b]);
    }
}
