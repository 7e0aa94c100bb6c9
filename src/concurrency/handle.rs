//! Scoped grants of several locks taken together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{trace, warn};

use super::error::{LockError, LockResult};
use super::lock::{AccessType, Lock, Lockable, LockableId};
use super::locker::Locker;

/// Queue-position wait budget used when the caller does not supply one.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A set of locks acquired atomically for one caller.
///
/// The handle is released exactly once, either explicitly through
/// [`LockHandle::release`] / [`Locker::release`] or when it goes out of
/// scope. Repeated releases are no-ops.
pub struct LockHandle {
    id: u64,
    locks: Vec<Arc<Lock>>,
    locker: Weak<Locker>,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(id: u64, locks: Vec<Arc<Lock>>, locker: Weak<Locker>) -> Self {
        Self {
            id,
            locks,
            locker,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn locks(&self) -> &[Arc<Lock>] {
        &self.locks
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether this handle holds live locks covering every bit of `access`
    /// on `resource`.
    pub fn holds(&self, resource: LockableId, access: AccessType) -> bool {
        if self.is_released() {
            return false;
        }
        let held = self
            .locks
            .iter()
            .filter(|lock| lock.resource() == resource && !lock.is_released())
            .fold(AccessType::empty(), |acc, lock| acc | lock.access());
        !access.is_empty() && held.contains(access)
    }

    /// Waits for queue position on every lock of this handle on `lockable`
    /// whose access is part of `access`.
    pub fn wait(
        &self,
        lockable: &dyn Lockable,
        access: AccessType,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        let resource = lockable.lockable_id();
        let timeout = timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);

        let matching: Vec<&Arc<Lock>> = self
            .locks
            .iter()
            .filter(|lock| lock.resource() == resource && access.contains(lock.access()))
            .collect();
        if matching.is_empty() {
            return Err(LockError::NotHeld {
                handle_id: self.id,
                resource,
                access,
            });
        }

        for lock in matching {
            lock.wait(lock.access(), timeout)?;
        }
        Ok(())
    }

    /// Waits for queue position on every lock of this handle.
    pub fn wait_all(&self, timeout: Option<Duration>) -> LockResult<()> {
        let timeout = timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);
        for lock in &self.locks {
            lock.wait(lock.access(), timeout)?;
        }
        Ok(())
    }

    /// Releases every lock in reverse acquisition order. Errors from
    /// individual locks do not stop the remaining releases; the first one is
    /// returned.
    pub fn release(&self) -> LockResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for lock in self.locks.iter().rev() {
            if let Err(e) = lock.release() {
                warn!("failed to release lock {} of handle {}: {}", lock.id(), self.id, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(locker) = self.locker.upgrade() {
            locker.forget(self.id);
        }
        trace!("released handle {} ({} locks)", self.id, self.locks.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            if let Err(e) = self.release() {
                warn!("error releasing dropped lock handle {}: {}", self.id, e);
            }
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.id)
            .field("locks", &self.locks)
            .field("released", &self.is_released())
            .finish()
    }
}
