//! Error types for store operations.
//!
//! Most "failures" in this crate are ordinary outcomes and are reported as
//! values: pool admission rejections return `None`, compare-and-swap style
//! mismatches return `false`. Only conditions that indicate a broken caller
//! or corrupt input surface as a [`StoreError`].

use std::fmt;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A raw bulk-insert found the key already mapped. Raw inserts are only
    /// used for warm restart, where a duplicate key means the source data
    /// is corrupt.
    DuplicateKey,

    /// The segment configuration failed validation.
    InvalidConfig(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "duplicate key detected"),
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
