//! Lock layer error types.

use std::time::Duration;

use thiserror::Error;

use super::lock::{AccessType, LockableId};

/// Errors raised by locks, locking queues and the locker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for {access:?} access to {resource}")]
    Timeout {
        resource: LockableId,
        access: AccessType,
        timeout: Duration,
    },

    #[error("Lock {lock_id} on {resource} released more times than it was acquired")]
    OverRelease { resource: LockableId, lock_id: u64 },

    #[error("Invalid access type {requested:?} for a lock with {held:?} access on {resource}")]
    InvalidAccess {
        resource: LockableId,
        requested: AccessType,
        held: AccessType,
    },

    #[error("Handle {handle_id} holds no {access:?} lock on {resource}")]
    NotHeld {
        handle_id: u64,
        resource: LockableId,
        access: AccessType,
    },

    #[error("Locking queue for {0} no longer exists")]
    QueueDropped(LockableId),
}

impl LockError {
    /// Only timeouts can succeed on a later attempt; everything else is a
    /// bookkeeping bug in the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;
