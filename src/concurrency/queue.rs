//! Per-resource FIFO of locks.
//!
//! The queue is a monitor: one mutex guards both the ordered lock list and
//! the reader/writer grant state, and one condition variable is signalled on
//! every change that could satisfy a waiter. Waiters re-check their
//! predicate after each wake.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::error::{LockError, LockResult};
use super::lock::{AccessType, Lock, Lockable, LockableId, LockingMode};

/// Exclusive grant, re-entrant for the owning handle.
#[derive(Debug, Clone, Copy)]
struct ExclusiveGrant {
    owner: u64,
    depth: usize,
}

#[derive(Default)]
struct QueueInner {
    /// Live and waiting locks in arrival order.
    locks: Vec<Arc<Lock>>,
    exclusive: Option<ExclusiveGrant>,
    shared: usize,
}

impl QueueInner {
    fn position(&self, lock: &Lock) -> Option<usize> {
        self.locks.iter().position(|l| l.id() == lock.id())
    }

    /// Mode-based grant predicate. Grants are made in arrival order: a lock
    /// never overtakes an earlier, still pending, conflicting lock of another
    /// owner.
    fn can_grant(&self, lock: &Lock) -> bool {
        let Some(position) = self.position(lock) else {
            return false;
        };

        let blocked_by_earlier = self.locks[..position].iter().any(|earlier| {
            earlier.owner() != lock.owner()
                && !earlier.is_acquired()
                && !earlier.mode().is_compatible_with(&lock.mode())
        });
        if blocked_by_earlier {
            return false;
        }

        let exclusive_free = self
            .exclusive
            .map_or(true, |grant| grant.owner == lock.owner());

        match lock.mode() {
            LockingMode::Exclusive => exclusive_free && self.shared == 0,
            LockingMode::Shared => exclusive_free,
        }
    }

    fn grant(&mut self, lock: &Lock) {
        match lock.mode() {
            LockingMode::Exclusive => {
                let grant = self.exclusive.get_or_insert(ExclusiveGrant {
                    owner: lock.owner(),
                    depth: 0,
                });
                grant.depth += 1;
            }
            LockingMode::Shared => self.shared += 1,
        }
        lock.mark_acquired();
    }

    fn release_exclusive(&mut self) {
        if let Some(grant) = self.exclusive.as_mut() {
            grant.depth = grant.depth.saturating_sub(1);
            if grant.depth == 0 {
                self.exclusive = None;
            }
        }
    }

    /// Decrements the shared counter. Going below zero is an over-release:
    /// the counter is pinned at zero and the caller must wake all waiters
    /// before reporting it.
    fn release_shared(&mut self) -> bool {
        if self.shared == 0 {
            return false;
        }
        self.shared -= 1;
        true
    }

    /// Queue-position predicate. Readers wait for earlier writers of other
    /// owners; writers wait until every earlier lock is their own.
    fn position_reached(&self, lock: &Lock, access: AccessType) -> bool {
        let Some(position) = self.position(lock) else {
            return true;
        };
        let earlier = &self.locks[..position];
        if access == AccessType::WRITE {
            earlier.iter().all(|l| l.owner() == lock.owner())
        } else {
            !earlier
                .iter()
                .any(|l| l.owner() != lock.owner() && l.access().contains(AccessType::WRITE))
        }
    }

    fn remove(&mut self, lock: &Lock) {
        self.locks.retain(|l| l.id() != lock.id());
    }
}

/// FIFO of locks for one lockable resource.
pub struct LockingQueue {
    lockable: Arc<dyn Lockable>,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    len: AtomicUsize,
}

impl LockingQueue {
    pub fn new(lockable: Arc<dyn Lockable>) -> Arc<Self> {
        Arc::new(Self {
            lockable,
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
        })
    }

    pub fn resource(&self) -> LockableId {
        self.lockable.lockable_id()
    }

    pub fn lockable(&self) -> &Arc<dyn Lockable> {
        &self.lockable
    }

    /// Creates a lock for `owner`, queues it and blocks until the mode-based
    /// grant succeeds. The queue-position wait is a separate step, see
    /// [`LockingQueue::wait`].
    ///
    /// On timeout the lock is removed from the queue again.
    pub fn lock(
        self: &Arc<Self>,
        owner: u64,
        mode: LockingMode,
        access: AccessType,
        timeout: Option<Duration>,
    ) -> LockResult<Arc<Lock>> {
        if !access.is_single() {
            return Err(LockError::InvalidAccess {
                resource: self.resource(),
                requested: access,
                held: access,
            });
        }

        let lock = self.new_lock(owner, mode, access);
        self.enqueue(std::slice::from_ref(&lock));
        if let Err(e) = self.acquire(&lock, timeout) {
            self.abandon(&lock);
            return Err(e);
        }
        Ok(lock)
    }

    /// Queues one lock per access bit of `access` in a single step, then
    /// grants them in order (Read before Write).
    ///
    /// No lock of another owner can arrive between the locks of one call. If
    /// any grant fails, the locks of this call are released or abandoned and
    /// none is returned.
    pub fn lock_all(
        self: &Arc<Self>,
        owner: u64,
        mode: LockingMode,
        access: AccessType,
        timeout: Option<Duration>,
    ) -> LockResult<Vec<Arc<Lock>>> {
        let singles: Vec<AccessType> = [AccessType::READ, AccessType::WRITE]
            .into_iter()
            .filter(|single| access.contains(*single))
            .collect();
        if singles.is_empty() {
            return Err(LockError::InvalidAccess {
                resource: self.resource(),
                requested: access,
                held: access,
            });
        }

        let locks: Vec<Arc<Lock>> = singles
            .into_iter()
            .map(|single| self.new_lock(owner, mode, single))
            .collect();
        self.enqueue(&locks);
        for (index, lock) in locks.iter().enumerate() {
            if let Err(e) = self.acquire(lock, timeout) {
                for pending in &locks[index..] {
                    self.abandon(pending);
                }
                for granted in locks[..index].iter().rev() {
                    if let Err(release_err) = self.release(granted) {
                        debug!("failed to undo lock {}: {}", granted.id(), release_err);
                    }
                }
                return Err(e);
            }
        }
        Ok(locks)
    }

    fn new_lock(self: &Arc<Self>, owner: u64, mode: LockingMode, access: AccessType) -> Arc<Lock> {
        Arc::new(Lock::new(
            Arc::downgrade(self),
            self.resource(),
            owner,
            mode,
            access,
        ))
    }

    /// Appends `locks` to the tail under a single hold of the monitor.
    fn enqueue(&self, locks: &[Arc<Lock>]) {
        for lock in locks {
            self.lockable.locked(lock);
        }
        let mut inner = self.inner.lock();
        inner.locks.extend(locks.iter().cloned());
        self.len.store(inner.locks.len(), Ordering::Release);
    }

    /// Mode-based acquisition of a lock already in this queue.
    pub(crate) fn acquire(&self, lock: &Lock, timeout: Option<Duration>) -> LockResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();

        while !inner.can_grant(lock) {
            if inner.position(lock).is_none() {
                return Err(LockError::QueueDropped(self.resource()));
            }
            trace!(
                "lock {} on {} waiting for {} grant",
                lock.id(),
                self.resource(),
                lock.mode()
            );
            if !self.park(&mut inner, deadline) && !inner.can_grant(lock) {
                debug!(
                    "lock {} on {} timed out waiting for {} grant",
                    lock.id(),
                    self.resource(),
                    lock.mode()
                );
                return Err(self.timeout_error(lock.access(), timeout));
            }
        }

        inner.grant(lock);
        trace!(
            "granted {} {:?} lock {} on {} to handle {}",
            lock.mode(),
            lock.access(),
            lock.id(),
            self.resource(),
            lock.owner()
        );
        Ok(())
    }

    /// Blocks until `lock` has reached its turn in the queue.
    ///
    /// `access` must be exactly the access type the lock was created with.
    pub fn wait(&self, lock: &Lock, access: AccessType, timeout: Duration) -> LockResult<()> {
        if !access.is_single() || access != lock.access() {
            return Err(LockError::InvalidAccess {
                resource: self.resource(),
                requested: access,
                held: lock.access(),
            });
        }
        if lock.is_checked() {
            return Ok(());
        }

        let deadline = Some(Instant::now() + timeout);
        let mut inner = self.inner.lock();
        while !inner.position_reached(lock, access) {
            if !self.park(&mut inner, deadline) && !inner.position_reached(lock, access) {
                debug!(
                    "lock {} on {} timed out after {:?} waiting for its {:?} turn",
                    lock.id(),
                    self.resource(),
                    timeout,
                    access
                );
                return Err(self.timeout_error(access, Some(timeout)));
            }
        }

        lock.mark_checked();
        Ok(())
    }

    /// Removes `lock` from the queue, returns its grant and wakes waiters.
    pub fn release(&self, lock: &Lock) -> LockResult<()> {
        let result = {
            let mut inner = self.inner.lock();
            if lock.mark_released() {
                self.cond.notify_all();
                return Err(LockError::OverRelease {
                    resource: self.resource(),
                    lock_id: lock.id(),
                });
            }

            inner.remove(lock);
            self.len.store(inner.locks.len(), Ordering::Release);

            let mut result = Ok(());
            if lock.is_acquired() {
                match lock.mode() {
                    LockingMode::Exclusive => inner.release_exclusive(),
                    LockingMode::Shared => {
                        if !inner.release_shared() {
                            result = Err(LockError::OverRelease {
                                resource: self.resource(),
                                lock_id: lock.id(),
                            });
                        }
                    }
                }
            }
            self.cond.notify_all();
            result
        };

        trace!("released lock {} on {}", lock.id(), self.resource());
        self.lockable.unlocked(lock);
        result
    }

    /// Number of queued locks. Reads a counter kept alongside the list so the
    /// probe never takes the monitor.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shared_count(&self) -> usize {
        self.inner.lock().shared
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.lock().exclusive.is_some()
    }

    /// Drops a lock that never got its grant.
    fn abandon(&self, lock: &Lock) {
        {
            let mut inner = self.inner.lock();
            lock.mark_released();
            inner.remove(lock);
            self.len.store(inner.locks.len(), Ordering::Release);
            self.cond.notify_all();
        }
        self.lockable.unlocked(lock);
    }

    /// Parks on the condition variable. Returns false once the deadline has
    /// passed.
    fn park(&self, inner: &mut MutexGuard<'_, QueueInner>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                !self.cond.wait_until(inner, deadline).timed_out()
            }
            None => {
                self.cond.wait(inner);
                true
            }
        }
    }

    fn timeout_error(&self, access: AccessType, timeout: Option<Duration>) -> LockError {
        LockError::Timeout {
            resource: self.resource(),
            access,
            timeout: timeout.unwrap_or_default(),
        }
    }
}
