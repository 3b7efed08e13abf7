//! Error types
//!
//! Everything that can go wrong is reported to the embedding host as a
//! [MemError]. The host decides whether an [MemError::InvariantViolation]
//! aborts the process or unwinds; this crate only guarantees that it
//! stops before touching memory it does not own.

use thiserror::Error;

/// Broken refcounting / handle discipline on the caller's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("handle does not refer to a live object")]
    StaleHandle,

    #[error("refcount would drop below zero")]
    Underflow,

    #[error("object is being destroyed and cannot gain new references")]
    Resurrection,

    #[error("attempted to release the baseline reference of an interned object")]
    PermanentRelease,

    #[error("unknown type tag {0}")]
    UnknownType(u32),

    #[error("access of {len} bytes at offset {offset} exceeds payload of {payload} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        payload: usize,
    },
}

/// Memory manager errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("allocation of {size} bytes failed")]
    AllocationFailure { size: usize },

    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] Violation),

    #[error("collection requested while a collection pass is already running")]
    CollectionReentrancy,

    #[error("unknown interning policy {0}")]
    UnknownPolicy(u32),
}

/// Memory manager result type.
pub type MemResult<T> = Result<T, MemError>;
