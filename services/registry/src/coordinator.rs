//! Allocation coordinator.
//!
//! The coordinator is the single entry point for both the RPC surface and
//! the reconcilers:
//! - Validating register/deregister requests against the declarative store
//! - Delegating slot assignment and release to the pool's table
//! - Resetting the pool's pace level after every allocation or release
//!   that changed the table
//! - Reporting occupancy for status mirroring

use std::sync::Arc;
use std::time::Duration;

use nireg_alloc::{AllocError, AllocSnapshot, AllocationStrategy, PlacementOutcome, Tags};
use nireg_id::PoolId;
use nireg_reconcile::{PaceLevel, PacePolicy, ReconciliationPacer};
use tracing::{debug, info, warn};

use crate::pools::{PoolHandle, PoolRegistry};
use crate::store::{RegistryStatus, RegistryStore, Selector, StoreError};

/// Selector entry naming the key to allocate.
pub const SELECTOR_NAME_KEY: &str = "name";

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors returned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The pool is not declared, or not initialized yet.
    #[error("pool not found: {0}")]
    PoolNotFound(PoolId),

    /// The registry exists but has not reached its ready condition.
    #[error("pool not ready: {0}")]
    PoolNotReady(PoolId),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No free slot is left for a new key.
    #[error("pool {pool} exhausted: all {capacity} indices are allocated")]
    PoolExhausted { pool: PoolId, capacity: u32 },

    /// The key is held by another owner and the policy forbids sharing it.
    #[error("key {key} in pool {pool} is already registered by {owner}")]
    OwnershipConflict {
        pool: PoolId,
        key: String,
        owner: String,
    },

    /// The declared capacity cannot back a pool.
    #[error("invalid capacity for pool {pool}: {source}")]
    InvalidCapacity {
        pool: PoolId,
        #[source]
        source: AllocError,
    },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl CoordinatorError {
    /// Returns true if a later retry may succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolNotFound(_) | Self::PoolNotReady(_) | Self::PoolExhausted { .. }
        )
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RegistryNotFound(pool) => Self::PoolNotFound(pool),
            other => Self::Store(other),
        }
    }
}

/// What to do when a key is registered again by a different owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Return the existing index and log a warning.
    #[default]
    KeepExisting,

    /// Fail with [`CoordinatorError::OwnershipConflict`].
    Reject,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-existing" => Ok(Self::KeepExisting),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown conflict policy '{other}' (expected 'keep-existing' or 'reject')"
            )),
        }
    }
}

/// A register or deregister request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Pool to allocate from.
    pub pool: PoolId,

    /// Name of the requesting entity.
    pub owner: String,

    /// Must contain [`SELECTOR_NAME_KEY`].
    pub selector: Option<Selector>,

    /// Identity tags stored with the allocation.
    pub source_tag: Option<Tags>,
}

impl RegisterRequest {
    /// Build a request for a bare key.
    pub fn for_key(pool: PoolId, owner: &str, key: &str, tags: Option<Tags>) -> Self {
        Self {
            pool,
            owner: owner.to_string(),
            selector: Some(Selector::from([(
                SELECTOR_NAME_KEY.to_string(),
                key.to_string(),
            )])),
            source_tag: tags,
        }
    }

    /// The key named by the selector.
    pub fn selector_key(&self) -> CoordinatorResult<&str> {
        let selector = self
            .selector
            .as_ref()
            .ok_or_else(|| CoordinatorError::InvalidRequest("request has no selector".into()))?;

        match selector.get(SELECTOR_NAME_KEY) {
            Some(key) if !key.is_empty() => Ok(key.as_str()),
            Some(_) => Err(CoordinatorError::InvalidRequest(
                "selector name is empty".into(),
            )),
            None => Err(CoordinatorError::InvalidRequest(
                "selector does not contain a name".into(),
            )),
        }
    }
}

/// Coordinates pools, pacing and validation.
pub struct AllocationCoordinator {
    pools: PoolRegistry,
    pacer: ReconciliationPacer,
    store: Arc<dyn RegistryStore>,
    conflict_policy: ConflictPolicy,
}

impl std::fmt::Debug for AllocationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationCoordinator")
            .field("pools", &self.pools.len())
            .field("conflict_policy", &self.conflict_policy)
            .finish_non_exhaustive()
    }
}

impl AllocationCoordinator {
    /// Create a coordinator backed by a declarative store.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            pools: PoolRegistry::new(),
            pacer: ReconciliationPacer::new(),
            store,
            conflict_policy: ConflictPolicy::default(),
        }
    }

    /// Replace the pacer (e.g. to change the maximum level).
    pub fn with_pacer(mut self, pacer: ReconciliationPacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Set the conflicting-registration policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// The declarative store this coordinator validates against.
    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Pool lifecycle
    // ------------------------------------------------------------------

    /// Create a hash-placed pool if it does not exist yet.
    pub fn init(&self, pool: &PoolId, capacity: u32) -> CoordinatorResult<bool> {
        self.init_with_strategy(pool, capacity, AllocationStrategy::Hash)
    }

    /// Create a pool with an explicit strategy if it does not exist yet.
    ///
    /// Returns `true` if the pool was created.
    pub fn init_with_strategy(
        &self,
        pool: &PoolId,
        capacity: u32,
        strategy: AllocationStrategy,
    ) -> CoordinatorResult<bool> {
        let created = self
            .pools
            .init_pool(pool, capacity, strategy)
            .map_err(|source| CoordinatorError::InvalidCapacity {
                pool: pool.clone(),
                source,
            })?;
        self.pacer.track(pool);

        if created {
            info!(pool = %pool, capacity, ?strategy, "pool initialized");
        }
        Ok(created)
    }

    /// Create a pool sized and placed as its registry record declares.
    pub fn init_from_store(&self, pool: &PoolId) -> CoordinatorResult<bool> {
        if self.pools.contains(pool) {
            self.pacer.track(pool);
            return Ok(false);
        }
        let capacity = self.store.get_size(pool)?;
        let strategy = self.store.allocation_strategy(pool)?;
        self.init_with_strategy(pool, capacity, strategy)
    }

    /// Drop a pool and its pace level, discarding all allocations.
    pub fn delete(&self, pool: &PoolId) -> bool {
        let existed = self.pools.delete_pool(pool);
        self.pacer.forget(pool);
        if existed {
            info!(pool = %pool, "pool deleted");
        }
        existed
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Assign an index to the request's key.
    ///
    /// Only a newly placed key resets the pool's pace level; re-registering
    /// a key that already holds a slot leaves pacing alone.
    pub fn register(&self, request: &RegisterRequest) -> CoordinatorResult<u32> {
        let key = self.validate(request)?;
        let handle = self
            .pools
            .get(&request.pool)
            .ok_or_else(|| CoordinatorError::PoolNotFound(request.pool.clone()))?;
        self.place(&handle, request, key)
    }

    fn place(
        &self,
        handle: &PoolHandle,
        request: &RegisterRequest,
        key: &str,
    ) -> CoordinatorResult<u32> {
        debug!(pool = %request.pool, key, owner = %request.owner, "pool insert");
        let placement = {
            let mut table = handle.lock();
            // The pool was deleted after the handle was fetched.
            if table.is_retired() {
                return Err(CoordinatorError::PoolNotFound(request.pool.clone()));
            }
            table.insert(key, &request.owner, request.source_tag.as_ref())
        }
        .map_err(|err| match err {
            AllocError::PoolExhausted { capacity } => CoordinatorError::PoolExhausted {
                pool: request.pool.clone(),
                capacity,
            },
            other => CoordinatorError::InvalidCapacity {
                pool: request.pool.clone(),
                source: other,
            },
        })?;

        if let PlacementOutcome::Conflict { owner, .. } = &placement.outcome {
            match self.conflict_policy {
                ConflictPolicy::KeepExisting => warn!(
                    pool = %request.pool,
                    key,
                    holder = %owner,
                    requester = %request.owner,
                    index = placement.index,
                    "key already registered by another owner; keeping existing allocation"
                ),
                ConflictPolicy::Reject => {
                    return Err(CoordinatorError::OwnershipConflict {
                        pool: request.pool.clone(),
                        key: key.to_string(),
                        owner: owner.clone(),
                    })
                }
            }
        }

        debug!(pool = %request.pool, key, index = placement.index, "pool inserted");
        if placement.is_new() {
            self.pacer.reset(&request.pool);
        }
        Ok(placement.index)
    }

    /// Release the request's key. Releasing an unknown key succeeds.
    ///
    /// Only an actual release resets the pool's pace level.
    pub fn deregister(&self, request: &RegisterRequest) -> CoordinatorResult<()> {
        let key = self.validate(request)?;
        let handle = self
            .pools
            .get(&request.pool)
            .ok_or_else(|| CoordinatorError::PoolNotFound(request.pool.clone()))?;
        self.unplace(&handle, request, key)
    }

    fn unplace(
        &self,
        handle: &PoolHandle,
        request: &RegisterRequest,
        key: &str,
    ) -> CoordinatorResult<()> {
        debug!(pool = %request.pool, key, "pool delete");
        let removed = {
            let mut table = handle.lock();
            if table.is_retired() {
                return Err(CoordinatorError::PoolNotFound(request.pool.clone()));
            }
            table.delete(key)
        };
        let released = removed.is_some();
        match removed {
            Some(allocation) if allocation.owner != request.owner => debug!(
                pool = %request.pool,
                key,
                holder = %allocation.owner,
                requester = %request.owner,
                "released key held by another owner"
            ),
            Some(_) => debug!(pool = %request.pool, key, "pool deleted"),
            None => debug!(pool = %request.pool, key, "key was not registered"),
        }

        if released {
            self.pacer.reset(&request.pool);
        }
        Ok(())
    }

    /// Assign an index to `key` on behalf of `owner`.
    pub fn allocate(
        &self,
        pool: &PoolId,
        owner: &str,
        key: &str,
        tags: Option<Tags>,
    ) -> CoordinatorResult<u32> {
        self.register(&RegisterRequest::for_key(pool.clone(), owner, key, tags))
    }

    /// Release `key` on behalf of `owner`.
    pub fn release(
        &self,
        pool: &PoolId,
        owner: &str,
        key: &str,
        tags: Option<Tags>,
    ) -> CoordinatorResult<()> {
        self.deregister(&RegisterRequest::for_key(pool.clone(), owner, key, tags))
    }

    /// Check the registry is declared and ready, and extract the key.
    ///
    /// Pool initialization is checked last, by the caller, once the pool
    /// handle is fetched.
    fn validate<'r>(&self, request: &'r RegisterRequest) -> CoordinatorResult<&'r str> {
        if !self.store.is_ready(&request.pool)? {
            debug!(pool = %request.pool, "registry not ready");
            return Err(CoordinatorError::PoolNotReady(request.pool.clone()));
        }
        request.selector_key()
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Occupancy of a pool; empty if the pool is not initialized.
    pub fn get_allocated(&self, pool: &PoolId) -> AllocSnapshot {
        self.pools.get_allocated(pool)
    }

    /// Status fields for mirroring into the registry record.
    ///
    /// An uninitialized pool reports zero capacity.
    pub fn status(&self, pool: &PoolId) -> RegistryStatus {
        let Some(handle) = self.pools.get(pool) else {
            return RegistryStatus::default();
        };
        let allocator = handle.lock();
        RegistryStatus::from_snapshot(allocator.capacity(), allocator.snapshot())
    }

    /// Identities of all initialized pools.
    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.pool_ids()
    }

    // ------------------------------------------------------------------
    // Pacing
    // ------------------------------------------------------------------

    /// Bring back the fast passes for a tracked pool.
    pub fn reset_pace(&self, pool: &PoolId) {
        self.pacer.reset(pool);
    }

    /// Record one observed pass, saturating at the pacer's cap.
    pub fn increment_pace(&self, pool: &PoolId) {
        self.pacer.increment(pool);
    }

    /// Current pace level; [`PaceLevel::INACTIVE`] for unknown pools.
    pub fn pace_level(&self, pool: &PoolId) -> PaceLevel {
        self.pacer.level(pool)
    }

    /// Delay before the pool's next reconciliation pass.
    pub fn next_delay(&self, pool: &PoolId, policy: &PacePolicy) -> Duration {
        let delay = self.pacer.next_delay(pool, policy);
        debug!(pool = %pool, level = %self.pacer.level(pool), ?delay, "pace");
        delay
    }
}
