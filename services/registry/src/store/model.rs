//! Declarative registry and register records.
//!
//! A *registry* declares a pool (its size and placement strategy) and
//! carries the status mirrored from the engine. A *register* asks for one
//! index out of a registry on behalf of a named key.

use std::collections::BTreeMap;

use nireg_alloc::{AllocSnapshot, AllocationStrategy, Tags};
use nireg_id::{IdError, PoolId};
use serde::{Deserialize, Serialize};

use crate::coordinator::RegisterRequest;

/// Register selector. Must carry the key to allocate under `name`.
pub type Selector = BTreeMap<String, String>;

/// Administrative state of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminState {
    #[default]
    Enable,
    Disable,
}

/// Desired state of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistrySpec {
    /// Number of indices in the pool.
    pub size: Option<u32>,

    /// Placement strategy; hash placement when absent.
    pub allocation_strategy: Option<AllocationStrategy>,

    pub admin_state: Option<AdminState>,

    pub description: Option<String>,
}

impl RegistrySpec {
    /// Spec with only a size.
    pub fn with_size(size: u32) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    /// Returns false only when explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        self.admin_state != Some(AdminState::Disable)
    }
}

/// Occupancy mirrored into a registry record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub total: u32,
    pub allocated: u32,
    pub available: u32,
    pub used: Vec<String>,
}

impl RegistryStatus {
    /// Status of a freshly created pool.
    pub fn initial(total: u32) -> Self {
        Self {
            total,
            allocated: 0,
            available: total,
            used: Vec::new(),
        }
    }

    /// Build a status from a pool snapshot.
    pub fn from_snapshot(total: u32, snapshot: AllocSnapshot) -> Self {
        Self {
            total,
            allocated: snapshot.allocated,
            available: total.saturating_sub(snapshot.allocated),
            used: snapshot.used,
        }
    }
}

/// A registry as held by the declarative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub id: PoolId,
    pub spec: RegistrySpec,

    /// Set once the record has reached its ready condition.
    pub ready: bool,

    /// Set when deletion was requested.
    pub deleting: bool,

    pub status: Option<RegistryStatus>,
}

impl RegistryRecord {
    /// A ready record with no status yet.
    pub fn new(id: PoolId, spec: RegistrySpec) -> Self {
        Self {
            id,
            spec,
            ready: true,
            deleting: false,
            status: None,
        }
    }
}

/// Identity of a register record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegisterKey {
    pub namespace: String,
    pub name: String,
}

impl RegisterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A register as held by the declarative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRecord {
    pub key: RegisterKey,

    /// Name of the registry (in the same namespace) to allocate from.
    pub registry: String,

    pub selector: Option<Selector>,
    pub source_tag: Option<Tags>,

    /// Set when deletion was requested.
    pub deleting: bool,

    /// Index recorded by the last successful allocation.
    pub index: Option<u32>,
}

impl RegisterRecord {
    /// Pool the register allocates from.
    pub fn pool_id(&self) -> Result<PoolId, IdError> {
        PoolId::new(self.key.namespace.as_str(), self.registry.as_str())
    }

    /// Translate into an engine request owned by this register.
    pub fn to_request(&self) -> Result<RegisterRequest, IdError> {
        Ok(RegisterRequest {
            pool: self.pool_id()?,
            owner: self.key.name.clone(),
            selector: self.selector.clone(),
            source_tag: self.source_tag.clone(),
        })
    }
}
