//! Reconciliation pacing primitives.
//!
//! After an allocation or release, the registry status that mirrors a pool
//! is stale until the next reconciliation pass. The pacer lets callers ask
//! for a few quick passes after each mutation before falling back to the
//! normal interval. Key concepts:
//!
//! - **Pace level**: a small per-pool counter, reset to 0 by mutations.
//! - **Tiers**: level 0 waits `very_short_wait`, levels 1-2 wait
//!   `short_wait`, anything higher waits the normal `reconcile_interval`.
//!   A level saturated at the pacer's cap always waits the normal interval.
//!
//! # Invariants
//!
//! - A tracked level never exceeds the configured maximum
//! - Unknown pools report [`PaceLevel::INACTIVE`]
//! - The pacer never reads the clock; it only tracks levels

use std::collections::HashMap;
use std::time::Duration;

use nireg_id::PoolId;
use parking_lot::Mutex;

/// Default normal reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Default wait after a level-1 or level-2 pass.
pub const DEFAULT_SHORT_WAIT: Duration = Duration::from_secs(5);

/// Default wait right after a mutation.
pub const DEFAULT_VERY_SHORT_WAIT: Duration = Duration::from_secs(1);

/// Default cap on the pace level. Levels below it are the fast tiers.
pub const DEFAULT_MAX_PACE_LEVEL: u32 = 3;

/// Pace level of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaceLevel(u32);

impl PaceLevel {
    /// Level right after a mutation.
    pub const RESET: Self = Self(0);

    /// Reported for pools the pacer does not track.
    pub const INACTIVE: Self = Self(u32::MAX);

    /// Creates a level from its raw value.
    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self(level)
    }

    /// Returns the raw level.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns true if the pool is tracked.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.0 != u32::MAX
    }
}

impl std::fmt::Display for PaceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_active() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "inactive")
        }
    }
}

/// Maps a pace level to the delay before the next pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacePolicy {
    /// Delay at level 0.
    pub very_short_wait: Duration,

    /// Delay at levels 1 and 2.
    pub short_wait: Duration,

    /// Delay once pacing is exhausted or inactive.
    pub reconcile_interval: Duration,
}

impl Default for PacePolicy {
    fn default() -> Self {
        Self {
            very_short_wait: DEFAULT_VERY_SHORT_WAIT,
            short_wait: DEFAULT_SHORT_WAIT,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

impl PacePolicy {
    /// Suggested delay for a level.
    pub fn delay_for(&self, level: PaceLevel) -> Duration {
        match level.value() {
            0 => self.very_short_wait,
            1 | 2 => self.short_wait,
            _ => self.reconcile_interval,
        }
    }
}

/// Per-pool pace levels.
///
/// Protected by its own lock, independent of any pool lock.
#[derive(Debug)]
pub struct ReconciliationPacer {
    max_level: u32,
    levels: Mutex<HashMap<PoolId, u32>>,
}

impl Default for ReconciliationPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationPacer {
    /// Create a pacer capped at [`DEFAULT_MAX_PACE_LEVEL`].
    pub fn new() -> Self {
        Self::with_max_level(DEFAULT_MAX_PACE_LEVEL)
    }

    /// Create a pacer with a custom cap.
    pub fn with_max_level(max_level: u32) -> Self {
        Self {
            // Keep the sentinel out of reach of tracked levels.
            max_level: max_level.min(u32::MAX - 1),
            levels: Mutex::new(HashMap::new()),
        }
    }

    /// The configured cap.
    pub fn max_level(&self) -> PaceLevel {
        PaceLevel(self.max_level)
    }

    /// Start tracking a pool at level 0. No-op if already tracked.
    pub fn track(&self, pool: &PoolId) {
        self.levels.lock().entry(pool.clone()).or_insert(0);
    }

    /// Stop tracking a pool.
    pub fn forget(&self, pool: &PoolId) {
        self.levels.lock().remove(pool);
    }

    /// Set a pool's level to 0.
    ///
    /// Untracked pools stay untracked, so a reset racing a `forget` cannot
    /// resurrect the entry.
    pub fn reset(&self, pool: &PoolId) {
        if let Some(level) = self.levels.lock().get_mut(pool) {
            *level = 0;
        }
    }

    /// Advance a pool's level by one, saturating at the cap.
    ///
    /// Untracked pools stay untracked.
    pub fn increment(&self, pool: &PoolId) {
        if let Some(level) = self.levels.lock().get_mut(pool) {
            *level = (*level + 1).min(self.max_level);
        }
    }

    /// Current level of a pool.
    pub fn level(&self, pool: &PoolId) -> PaceLevel {
        self.levels
            .lock()
            .get(pool)
            .map_or(PaceLevel::INACTIVE, |level| PaceLevel(*level))
    }

    /// Delay before the next pass for a pool, consuming one fast tier.
    ///
    /// The delay is chosen from the level observed before advancing it, so
    /// the first pass after a reset gets `very_short_wait`. Once the level
    /// sits at the cap the normal interval applies, whatever the cap is.
    pub fn next_delay(&self, pool: &PoolId, policy: &PacePolicy) -> Duration {
        let observed = {
            let mut levels = self.levels.lock();
            match levels.get_mut(pool) {
                Some(level) => {
                    let observed = *level;
                    if observed < self.max_level {
                        *level += 1;
                    }
                    PaceLevel(observed)
                }
                None => PaceLevel::INACTIVE,
            }
        };

        if observed.value() >= self.max_level {
            return policy.reconcile_interval;
        }
        policy.delay_for(observed)
    }

    /// Number of tracked pools.
    pub fn len(&self) -> usize {
        self.levels.lock().len()
    }

    /// Returns true if no pool is tracked.
    pub fn is_empty(&self) -> bool {
        self.levels.lock().is_empty()
    }
}
