//! # nireg-id
//!
//! Identity types for the ni-registry allocation engine.
//!
//! ## Design Principles
//!
//! - A pool is identified by the namespace and name of the registry that
//!   declares it, never by an ad-hoc concatenated string
//! - `PoolId` has one canonical string form with strict parsing
//! - The canonical form round-trips (parse → format → parse)
//!
//! ## ID Format
//!
//! Pool IDs render as `{namespace}.{name}`:
//!
//! - `default.ni-registry`
//! - `tenant-a.vpc-indices`
//!
//! Neither segment may be empty or contain the `.` separator, so the
//! rendering is unambiguous.

mod error;
mod types;

pub use error::IdError;
pub use types::*;
