//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is missing the `.` separator between namespace and name.
    #[error("ID missing '.' separator between namespace and name")]
    MissingSeparator,

    /// One of the segments is unusable.
    #[error("invalid {segment}: {reason}")]
    InvalidSegment {
        segment: &'static str,
        reason: &'static str,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
