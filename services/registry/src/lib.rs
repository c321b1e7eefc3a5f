//! Network-instance index registry.
//!
//! This crate primarily ships the `ni-registry` binary, but we expose the
//! coordinator, store and reconcilers as a library for integration testing
//! and embedding.

pub mod config;
pub mod coordinator;
pub mod pools;
pub mod reconciler;
pub mod state;
pub mod store;
