// This module defines error types for the allocator using the thiserror crate for idiomatic
// Rust error handling. CompileError is the single error enum of the crate: every condition
// the allocator treats as fatal (no legal site for a read, a freeze/thaw imbalance, a steal
// of a pinned resource, a value without any source, an unsatisfiable junction) aborts the
// compilation of the current unit through one of its variants, as do encoding failures of
// the bundled x86 target and promises still unresolved when final bytes are written.
// CompileResult<T> is the convenience alias used throughout the crate.

//! Error types for the allocator.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use super::register_file::RegAllocError;

/// Main error type for compiling one unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("No legal site for read of v{value} in event {event}: {reason}")]
    NoSiteAvailable {
        value: usize,
        event: usize,
        reason: String,
    },

    #[error("Value v{value} has no site to read from")]
    NoSource { value: usize },

    #[error("Freeze/thaw imbalance on {resource}: {reason}")]
    FreezeImbalance { resource: String, reason: String },

    #[error("Cannot steal pinned resource {resource} from v{value}")]
    PinnedResource { resource: String, value: usize },

    #[error("Conflicting placements at junction into event {event}: {reason}")]
    JunctionConflict { event: usize, reason: String },

    #[error("Promise {promise} unresolved at write time")]
    UnresolvedPromise { promise: usize },

    #[error("Register allocation failed: {0:?}")]
    RegisterAllocation(RegAllocError),

    #[error("Encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Invalid compiler state: {reason}")]
    InvalidState { reason: String },
}

impl From<RegAllocError> for CompileError {
    fn from(err: RegAllocError) -> Self {
        Self::RegisterAllocation(err)
    }
}

impl CompileError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
