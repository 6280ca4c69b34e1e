//! Error types for the Starling replication substrate.
//!
//! One enum covers every failure kind spec'd for the core: invalid
//! eventstamps, merge-time structural corruption, and the two store-level
//! conflicts (`DuplicateId`, `NotFound`). A `Validation` variant is kept for
//! external plugins that want to surface a validation failure through the
//! same `Result` type the store already uses.

use thiserror::Error;

/// Every failure the core can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StarlingError {
    /// A string did not match the eventstamp grammar
    /// (`YYYY-MM-DDTHH:MM:SS.sssZ|CCCC|NNNN`).
    #[error("invalid eventstamp: {0:?}")]
    InvalidEventstamp(String),

    /// Merge found a leaf on one side and a nested record on the other at
    /// the same path.
    #[error("structure mismatch at `{path}`: {reason}")]
    StructureMismatch {
        /// Dot-separated path into the document where the mismatch occurred.
        path: String,
        /// Human-readable description of the conflicting shapes.
        reason: String,
    },

    /// Merge found two leaves of data that cannot be reconciled (reserved
    /// for producers that want a sharper signal than `StructureMismatch`;
    /// the core itself only ever raises `StructureMismatch` since LWW never
    /// needs to compare leaf value types to pick a winner).
    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        /// Dot-separated path into the document where the mismatch occurred.
        path: String,
        /// The shape that was expected at this path.
        expected: &'static str,
        /// The shape that was actually found.
        found: &'static str,
    },

    /// `add` was called with an id that already names a live (non-tombstoned)
    /// document.
    #[error("duplicate id: {0:?}")]
    DuplicateId(String),

    /// `update` or `remove` targeted an id with no live document.
    #[error("not found: {0:?}")]
    NotFound(String),

    /// An external validator rejected a value. The core never raises this
    /// itself; it exists so plugins can surface validation failures through
    /// the same error type the store's own operations use.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StarlingError>;
