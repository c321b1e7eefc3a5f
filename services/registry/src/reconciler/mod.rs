//! Reconcilers that keep pools and declarative records converged.
//!
//! - The registry reconciler initializes pools from registry records,
//!   mirrors occupancy back as status and gates registry deletion on the
//!   pool being empty
//! - The register reconciler allocates or releases each register's index
//! - The worker drives both on a tick, pacing registries after mutations

mod register;
mod registry;
mod worker;

use nireg_id::IdError;

use crate::coordinator::CoordinatorError;
use crate::store::StoreError;

pub use register::{RegisterOutcome, RegisterReconciler};
pub use registry::{RegistryOutcome, RegistryReconciler};
pub use worker::{PassStats, ReconcileWorker, Schedule, WorkerConfig};

/// Result type for reconcile operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that can occur during reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid registry reference: {0}")]
    InvalidReference(#[from] IdError),
}

impl ReconcileError {
    /// Returns true if the next pass may succeed without a record change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Coordinator(err) => err.is_retryable(),
            Self::Store(_) | Self::InvalidReference(_) => false,
        }
    }
}
