//! Slot tables for scarce integer indices.
//!
//! An [`Allocator`] hands out indices in `[0, capacity)` to named keys:
//! - Placement is deterministic: the home slot depends only on the key
//! - Collisions are resolved by linear probing with wraparound
//! - Released slots become tombstones so other keys' probe chains stay intact
//!
//! # Invariants
//!
//! - `0 <= allocated <= capacity`, and capacity never changes
//! - No two occupied slots share a key or an index
//! - Inserting a key that already holds a slot never consumes a second one

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest capacity a single table accepts.
pub const MAX_CAPACITY: u32 = 1 << 24;

/// Allocation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// A table must hold at least one slot.
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    /// Requested capacity exceeds [`MAX_CAPACITY`].
    #[error("capacity {requested} exceeds the maximum of {max}")]
    CapacityTooLarge { requested: u32, max: u32 },

    /// Every slot is occupied by another key.
    #[error("pool exhausted: all {capacity} slots are allocated")]
    PoolExhausted { capacity: u32 },
}

// ============================================================================
// Model
// ============================================================================

/// Tag set attached to an allocation (e.g. the requesting resource's source tag).
pub type Tags = BTreeMap<String, String>;

/// How a key's home slot is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// Home slot is a stable hash of the key.
    #[default]
    Hash,

    /// Home slot is always 0, so keys fill the lowest free index first.
    FirstAvailable,
}

impl AllocationStrategy {
    /// Parse the strategy name used in registry specs.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hash" => Some(Self::Hash),
            "first-available" => Some(Self::FirstAvailable),
            _ => None,
        }
    }
}

/// An occupied slot's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// The registered name (unique within the table).
    pub key: String,

    /// The entity that registered the key.
    pub owner: String,

    /// Identity tags supplied with the registration, if any.
    pub tags: Option<Tags>,
}

impl Allocation {
    fn is_held_by(&self, owner: &str, tags: Option<&Tags>) -> bool {
        self.owner == owner && self.tags.as_ref() == tags
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(Box<Allocation>),
}

/// What an insert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// The key took a free slot.
    Inserted,

    /// The key was already registered by the same owner and tags.
    Existing,

    /// The key is registered under a different owner or tag set. The existing
    /// allocation is left untouched; its holder is reported here.
    Conflict { owner: String, tags: Option<Tags> },
}

/// Result of a successful insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Slot index held by the key.
    pub index: u32,

    /// How the index was obtained.
    pub outcome: PlacementOutcome,
}

impl Placement {
    /// Returns true if this insert consumed a new slot.
    pub fn is_new(&self) -> bool {
        matches!(self.outcome, PlacementOutcome::Inserted)
    }

    /// Returns true if the key is held by someone else.
    pub fn is_conflict(&self) -> bool {
        matches!(self.outcome, PlacementOutcome::Conflict { .. })
    }
}

enum Probe {
    Found(usize),
    Vacant(usize),
    Full,
}

// ============================================================================
// Allocator
// ============================================================================

/// Fixed-capacity slot table.
#[derive(Debug)]
pub struct Allocator {
    slots: Vec<Slot>,
    allocated: u32,
    strategy: AllocationStrategy,
}

impl Allocator {
    /// Create an empty table using hash placement.
    pub fn new(capacity: u32) -> Result<Self, AllocError> {
        Self::with_strategy(capacity, AllocationStrategy::Hash)
    }

    /// Create an empty table with the given placement strategy.
    pub fn with_strategy(capacity: u32, strategy: AllocationStrategy) -> Result<Self, AllocError> {
        if capacity == 0 {
            return Err(AllocError::ZeroCapacity);
        }
        if capacity > MAX_CAPACITY {
            return Err(AllocError::CapacityTooLarge {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }

        Ok(Self {
            slots: (0..capacity).map(|_| Slot::Empty).collect(),
            allocated: 0,
            strategy,
        })
    }

    /// Register `key`, returning the slot it holds.
    ///
    /// Re-inserting a key returns its current index without consuming
    /// another slot, whether or not owner and tags match.
    pub fn insert(
        &mut self,
        key: &str,
        owner: &str,
        tags: Option<&Tags>,
    ) -> Result<Placement, AllocError> {
        match self.probe(key) {
            Probe::Found(idx) => {
                let Slot::Occupied(existing) = &self.slots[idx] else {
                    unreachable!("probe only reports occupied slots as found");
                };
                let outcome = if existing.is_held_by(owner, tags) {
                    PlacementOutcome::Existing
                } else {
                    PlacementOutcome::Conflict {
                        owner: existing.owner.clone(),
                        tags: existing.tags.clone(),
                    }
                };
                Ok(Placement {
                    index: idx as u32,
                    outcome,
                })
            }
            Probe::Vacant(idx) => {
                self.slots[idx] = Slot::Occupied(Box::new(Allocation {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    tags: tags.cloned(),
                }));
                self.allocated += 1;
                Ok(Placement {
                    index: idx as u32,
                    outcome: PlacementOutcome::Inserted,
                })
            }
            Probe::Full => Err(AllocError::PoolExhausted {
                capacity: self.capacity(),
            }),
        }
    }

    /// Release the slot held by `key`.
    ///
    /// Release is keyed on the key alone; the caller's owner and tags are not
    /// compared. Returns the removed allocation, or `None` if the key held no
    /// slot.
    pub fn delete(&mut self, key: &str) -> Option<Allocation> {
        let Probe::Found(idx) = self.probe(key) else {
            return None;
        };

        let Slot::Occupied(removed) = std::mem::replace(&mut self.slots[idx], Slot::Tombstone)
        else {
            unreachable!("probe only reports occupied slots as found");
        };
        self.allocated -= 1;

        // With nothing left, no probe chain can depend on a tombstone.
        if self.allocated == 0 {
            self.slots.iter_mut().for_each(|slot| *slot = Slot::Empty);
        }

        Some(*removed)
    }

    /// Look up the allocation held by `key`.
    pub fn get(&self, key: &str) -> Option<(u32, &Allocation)> {
        match self.probe(key) {
            Probe::Found(idx) => match &self.slots[idx] {
                Slot::Occupied(allocation) => Some((idx as u32, allocation.as_ref())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Iterate over occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Allocation)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match slot {
            Slot::Occupied(allocation) => Some((idx as u32, allocation.as_ref())),
            _ => None,
        })
    }

    /// Take a point-in-time copy of the occupied keys.
    pub fn snapshot(&self) -> AllocSnapshot {
        AllocSnapshot {
            allocated: self.allocated,
            used: self.iter().map(|(_, a)| a.key.clone()).collect(),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of occupied slots.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Number of slots a new key could take.
    pub fn available(&self) -> u32 {
        self.capacity() - self.allocated
    }

    /// Placement strategy this table was created with.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn home_slot(&self, key: &str) -> usize {
        match self.strategy {
            AllocationStrategy::Hash => (stable_hash(key) % self.slots.len() as u64) as usize,
            AllocationStrategy::FirstAvailable => 0,
        }
    }

    /// Walk the probe chain for `key` once around the table.
    ///
    /// The chain ends at the first never-used slot. Tombstones are skipped
    /// during lookup but the first one seen is preferred for insertion.
    fn probe(&self, key: &str) -> Probe {
        let capacity = self.slots.len();
        let home = self.home_slot(key);
        let mut reusable = None;

        for step in 0..capacity {
            let idx = (home + step) % capacity;
            match &self.slots[idx] {
                Slot::Empty => return Probe::Vacant(reusable.unwrap_or(idx)),
                Slot::Tombstone => {
                    reusable.get_or_insert(idx);
                }
                Slot::Occupied(allocation) if allocation.key == key => return Probe::Found(idx),
                Slot::Occupied(_) => {}
            }
        }

        match reusable {
            Some(idx) => Probe::Vacant(idx),
            None => Probe::Full,
        }
    }
}

/// Hash a key to a value that is stable across processes and platforms.
fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

// ============================================================================
// Snapshot
// ============================================================================

/// Occupancy of a table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSnapshot {
    /// Number of occupied slots.
    pub allocated: u32,

    /// Keys of the occupied slots, in slot index order.
    pub used: Vec<String>,
}

impl AllocSnapshot {
    /// Iterate over the used keys. Each call starts from the beginning.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.used.iter()
    }

    /// Returns true if `key` held a slot when the snapshot was taken.
    pub fn contains(&self, key: &str) -> bool {
        self.used.iter().any(|k| k == key)
    }

    /// Returns true if nothing was allocated.
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }
}

impl<'a> IntoIterator for &'a AllocSnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
