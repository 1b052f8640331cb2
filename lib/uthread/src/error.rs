//! The error taxonomy shared by every fallible entry point in this crate.

/// Errors reported by the scheduler, semaphore, and `ffi` surfaces.
///
/// Hand-rolled rather than derived via a macro crate: the set is small,
/// fixed, and carries no payload worth a richer representation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// A null handle was passed to an `ffi` operation. Unreachable from the
    /// safe Rust API, which takes references instead of raw pointers.
    InvalidArgument,
    /// Allocating a TCB, stack, context, or queue node failed.
    ResourceExhausted,
    /// Attempted to destroy a semaphore that still has blocked waiters.
    InUse,
    /// Internal: [`uthread_queue::Fifo::remove_where`] found no match. Not
    /// reachable through any operation this crate exposes; kept because
    /// `uthread-queue` is published standalone.
    NotFound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument: null handle"),
            Error::ResourceExhausted => write!(f, "resource allocation failed"),
            Error::InUse => write!(f, "object still in use"),
            Error::NotFound => write!(f, "no matching element"),
        }
    }
}

impl std::error::Error for Error {}

impl From<uthread_ctx::CtxError> for Error {
    fn from(_: uthread_ctx::CtxError) -> Self {
        Error::ResourceExhausted
    }
}
