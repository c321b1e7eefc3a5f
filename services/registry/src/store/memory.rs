//! In-memory declarative store, optionally seeded from a TOML manifest.
//!
//! Manifest format:
//!
//! ```toml
//! [[registry]]
//! namespace = "default"
//! name = "ni-registry"
//! size = 1000
//! allocation-strategy = "hash"
//!
//! [[register]]
//! namespace = "default"
//! name = "reg-prov"
//! registry = "ni-registry"
//! selector = { name = "prov" }
//! source-tag = { vpc = "test" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nireg_alloc::Tags;
use nireg_id::{IdError, PoolId};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use super::{
    RegisterKey, RegisterRecord, RegistryRecord, RegistrySpec, RegistryStatus, RegistryStore,
    Selector, StoreError,
};

/// Errors loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid registry identity: {0}")]
    InvalidId(#[from] IdError),

    #[error("duplicate {kind} in manifest: {name}")]
    Duplicate { kind: &'static str, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Manifest {
    #[serde(default)]
    registry: Vec<ManifestRegistry>,
    #[serde(default)]
    register: Vec<ManifestRegister>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ManifestRegistry {
    namespace: String,
    name: String,
    #[serde(default = "default_ready")]
    ready: bool,
    #[serde(flatten)]
    spec: RegistrySpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ManifestRegister {
    namespace: String,
    name: String,
    registry: String,
    selector: Option<Selector>,
    source_tag: Option<Tags>,
}

fn default_ready() -> bool {
    true
}

#[derive(Debug, Default)]
struct Inner {
    registries: BTreeMap<PoolId, RegistryRecord>,
    registers: BTreeMap<RegisterKey, RegisterRecord>,
}

/// Declarative store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest.
    pub fn from_manifest_str(contents: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(contents)?;
        let mut inner = Inner::default();

        for entry in manifest.registry {
            let id = PoolId::new(entry.namespace, entry.name)?;
            let mut record = RegistryRecord::new(id.clone(), entry.spec);
            record.ready = entry.ready;
            if inner.registries.insert(id.clone(), record).is_some() {
                return Err(ManifestError::Duplicate {
                    kind: "registry",
                    name: id.to_string(),
                });
            }
        }

        for entry in manifest.register {
            let key = RegisterKey::new(entry.namespace, entry.name);
            let record = RegisterRecord {
                key: key.clone(),
                registry: entry.registry,
                selector: entry.selector,
                source_tag: entry.source_tag,
                deleting: false,
                index: None,
            };
            // Surface a bad registry reference at load time.
            record.pool_id()?;
            if inner.registers.insert(key.clone(), record).is_some() {
                return Err(ManifestError::Duplicate {
                    kind: "register",
                    name: key.to_string(),
                });
            }
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Read and parse a manifest file.
    pub fn from_manifest_path(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_manifest_str(&contents)
    }

    /// Declare or update a registry. Status and flags of an existing record
    /// are kept.
    pub fn upsert_registry(&self, id: PoolId, spec: RegistrySpec) {
        let mut inner = self.inner.write();
        match inner.registries.get_mut(&id) {
            Some(record) => record.spec = spec,
            None => {
                inner
                    .registries
                    .insert(id.clone(), RegistryRecord::new(id, spec));
            }
        }
    }

    /// Flip a registry's ready condition.
    pub fn set_ready(&self, pool: &PoolId, ready: bool) -> Result<(), StoreError> {
        self.with_registry(pool, |record| record.ready = ready)
    }

    /// Request deletion of a registry.
    pub fn mark_registry_deleting(&self, pool: &PoolId) -> Result<(), StoreError> {
        self.with_registry(pool, |record| record.deleting = true)
    }

    /// Declare or replace a register.
    pub fn upsert_register(&self, record: RegisterRecord) {
        self.inner
            .write()
            .registers
            .insert(record.key.clone(), record);
    }

    /// Fetch a register record.
    pub fn register(&self, key: &RegisterKey) -> Option<RegisterRecord> {
        self.inner.read().registers.get(key).cloned()
    }

    /// Request deletion of a register.
    pub fn mark_register_deleting(&self, key: &RegisterKey) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .registers
            .get_mut(key)
            .ok_or_else(|| StoreError::RegisterNotFound(key.clone()))?;
        record.deleting = true;
        Ok(())
    }

    fn with_registry(
        &self,
        pool: &PoolId,
        f: impl FnOnce(&mut RegistryRecord),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .registries
            .get_mut(pool)
            .ok_or_else(|| StoreError::RegistryNotFound(pool.clone()))?;
        f(record);
        Ok(())
    }
}

impl RegistryStore for InMemoryStore {
    fn registry(&self, pool: &PoolId) -> Result<RegistryRecord, StoreError> {
        self.inner
            .read()
            .registries
            .get(pool)
            .cloned()
            .ok_or_else(|| StoreError::RegistryNotFound(pool.clone()))
    }

    fn registries(&self) -> Vec<PoolId> {
        self.inner.read().registries.keys().cloned().collect()
    }

    fn set_registry_status(
        &self,
        pool: &PoolId,
        status: RegistryStatus,
    ) -> Result<(), StoreError> {
        self.with_registry(pool, |record| record.status = Some(status))
    }

    fn remove_registry(&self, pool: &PoolId) -> Result<(), StoreError> {
        self.inner
            .write()
            .registries
            .remove(pool)
            .map(|_| ())
            .ok_or_else(|| StoreError::RegistryNotFound(pool.clone()))
    }

    fn registers(&self) -> Vec<RegisterRecord> {
        self.inner.read().registers.values().cloned().collect()
    }

    fn set_register_index(&self, key: &RegisterKey, index: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .registers
            .get_mut(key)
            .ok_or_else(|| StoreError::RegisterNotFound(key.clone()))?;
        record.index = Some(index);
        Ok(())
    }

    fn remove_register(&self, key: &RegisterKey) -> Result<(), StoreError> {
        self.inner
            .write()
            .registers
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::RegisterNotFound(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use nireg_alloc::AllocationStrategy;

    use super::*;

    const MANIFEST: &str = r#"
[[registry]]
namespace = "default"
name = "ni-registry"
size = 100
allocation-strategy = "first-available"
description = "network instances"

[[registry]]
namespace = "default"
name = "pending"
size = 10
ready = false

[[register]]
namespace = "default"
name = "reg-prov"
registry = "ni-registry"
selector = { name = "prov" }
source-tag = { vpc = "test" }
"#;

    fn pool(name: &str) -> PoolId {
        PoolId::new("default", name).unwrap()
    }

    #[test]
    fn test_manifest_loads() {
        let store = InMemoryStore::from_manifest_str(MANIFEST).unwrap();

        assert_eq!(store.registries().len(), 2);
        assert_eq!(store.get_size(&pool("ni-registry")).unwrap(), 100);
        assert_eq!(
            store.allocation_strategy(&pool("ni-registry")).unwrap(),
            AllocationStrategy::FirstAvailable
        );
        assert!(store.is_ready(&pool("ni-registry")).unwrap());
        assert!(!store.is_ready(&pool("pending")).unwrap());

        let registers = store.registers();
        assert_eq!(registers.len(), 1);
        assert_eq!(registers[0].registry, "ni-registry");
        assert_eq!(
            registers[0].source_tag.as_ref().unwrap().get("vpc"),
            Some(&"test".to_string())
        );
    }

    #[test]
    fn test_manifest_rejects_duplicates() {
        let manifest = r#"
[[registry]]
namespace = "default"
name = "a"
size = 1

[[registry]]
namespace = "default"
name = "a"
size = 2
"#;
        assert!(matches!(
            InMemoryStore::from_manifest_str(manifest),
            Err(ManifestError::Duplicate { kind: "registry", .. })
        ));
    }

    #[test]
    fn test_manifest_rejects_bad_identity() {
        let manifest = r#"
[[registry]]
namespace = "default"
name = "has.dot"
size = 1
"#;
        assert!(matches!(
            InMemoryStore::from_manifest_str(manifest),
            Err(ManifestError::InvalidId(_))
        ));
    }

    #[test]
    fn test_missing_registry() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.is_ready(&pool("nope")).unwrap_err(),
            StoreError::RegistryNotFound(pool("nope"))
        );
    }

    #[test]
    fn test_missing_size() {
        let store = InMemoryStore::new();
        store.upsert_registry(pool("sizeless"), RegistrySpec::default());
        assert_eq!(
            store.get_size(&pool("sizeless")).unwrap_err(),
            StoreError::MissingSize(pool("sizeless"))
        );
    }

    #[test]
    fn test_upsert_keeps_status() {
        let store = InMemoryStore::new();
        let id = pool("ni-registry");
        store.upsert_registry(id.clone(), RegistrySpec::with_size(4));
        store
            .set_registry_status(&id, RegistryStatus::initial(4))
            .unwrap();

        store.upsert_registry(id.clone(), RegistrySpec::with_size(8));

        let record = store.registry(&id).unwrap();
        assert_eq!(record.spec.size, Some(8));
        assert_eq!(record.status, Some(RegistryStatus::initial(4)));
    }
}
