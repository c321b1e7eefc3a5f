//! Application state shared by the worker and the binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use nireg_reconcile::ReconciliationPacer;
use tracing::info;

use crate::config::Config;
use crate::coordinator::AllocationCoordinator;
use crate::reconciler::ReconcileWorker;
use crate::store::{InMemoryStore, RegistryStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<InMemoryStore>,
    coordinator: Arc<AllocationCoordinator>,
}

impl AppState {
    /// Create a new application state around an existing store.
    pub fn new(store: Arc<InMemoryStore>, config: &Config) -> Self {
        let coordinator = AllocationCoordinator::new(store.clone())
            .with_pacer(ReconciliationPacer::with_max_level(config.max_pace_level))
            .with_conflict_policy(config.conflict_policy);

        Self {
            inner: Arc::new(AppStateInner {
                store,
                coordinator: Arc::new(coordinator),
            }),
        }
    }

    /// Build the state from configuration, loading the manifest if one is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = match &config.manifest_path {
            Some(path) => {
                let store = InMemoryStore::from_manifest_path(path)
                    .with_context(|| format!("failed to load manifest {}", path.display()))?;
                info!(
                    path = %path.display(),
                    registries = store.registries().len(),
                    registers = store.registers().len(),
                    "Manifest loaded"
                );
                store
            }
            None => InMemoryStore::new(),
        };

        Ok(Self::new(Arc::new(store), config))
    }

    /// Get a reference to the declarative store.
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.inner.store
    }

    /// Get a reference to the coordinator.
    pub fn coordinator(&self) -> &Arc<AllocationCoordinator> {
        &self.inner.coordinator
    }

    /// Create a reconcile worker over this state.
    pub fn worker(&self, config: &Config) -> ReconcileWorker {
        ReconcileWorker::new(
            self.inner.coordinator.clone(),
            self.inner.store.clone(),
            config.worker_config(),
        )
    }
}
