//! Per-database registry of locking queues.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use super::error::LockResult;
use super::handle::LockHandle;
use super::lock::{AccessType, Lock, Lockable, LockableId, LockingMode};
use super::queue::LockingQueue;

/// Maps lockable resources to their [`LockingQueue`] and tracks the handles
/// it has issued.
///
/// Queues are created lazily and live as long as the locker. Bookkeeping on
/// the map and the open-handle set never blocks; threads only park inside a
/// specific queue.
pub struct Locker {
    queues: DashMap<LockableId, Arc<LockingQueue>>,
    open_handles: Mutex<HashSet<u64>>,
    next_handle_id: AtomicU64,
    /// Budget for the mode-based grant; `None` blocks until granted.
    acquire_timeout: Option<Duration>,
}

impl Locker {
    /// Creates a locker whose grants block until they succeed.
    pub fn new() -> Arc<Self> {
        Self::with_acquire_timeout(None)
    }

    pub fn with_acquire_timeout(acquire_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            open_handles: Mutex::new(HashSet::new()),
            next_handle_id: AtomicU64::new(1),
            acquire_timeout,
        })
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    /// Locks every resource in `lockables` for `access` in the given order.
    ///
    /// Callers locking several resources concurrently must present them in a
    /// consistent order; no global order is imposed here.
    pub fn lock(
        self: &Arc<Self>,
        lockables: &[Arc<dyn Lockable>],
        access: AccessType,
        mode: LockingMode,
    ) -> LockResult<LockHandle> {
        self.lock_with_timeout(lockables, access, mode, self.acquire_timeout)
    }

    /// Like [`Locker::lock`] with an explicit grant budget.
    ///
    /// If any grant fails, the locks already taken for this request are
    /// released in reverse order and no handle is issued.
    pub fn lock_with_timeout(
        self: &Arc<Self>,
        lockables: &[Arc<dyn Lockable>],
        access: AccessType,
        mode: LockingMode,
        timeout: Option<Duration>,
    ) -> LockResult<LockHandle> {
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let mut locks: Vec<Arc<Lock>> = Vec::with_capacity(lockables.len() * 2);

        for lockable in lockables {
            let queue = self.queue_for(lockable);
            match queue.lock_all(handle_id, mode, access, timeout) {
                Ok(taken) => locks.extend(taken),
                Err(e) => {
                    debug!(
                        "handle {} failed to lock {}: {}; releasing {} acquired locks",
                        handle_id,
                        lockable.lockable_id(),
                        e,
                        locks.len()
                    );
                    for lock in locks.iter().rev() {
                        if let Err(release_err) = lock.release() {
                            warn!("failed to undo lock {}: {}", lock.id(), release_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        self.open_handles.lock().insert(handle_id);
        debug!(
            "issued handle {} with {} {} locks for {:?}",
            handle_id,
            locks.len(),
            mode,
            access
        );
        Ok(LockHandle::new(handle_id, locks, Arc::downgrade(self)))
    }

    /// Releases `handle`. Idempotent.
    pub fn release(&self, handle: &LockHandle) -> LockResult<()> {
        handle.release()
    }

    /// Waits until `access` could be granted on every resource, without
    /// keeping any lock afterwards.
    ///
    /// Resources are checked one at a time, each through its own short-lived
    /// shared handle, so the check never holds one resource while waiting on
    /// another.
    pub fn check_access(
        self: &Arc<Self>,
        lockables: &[Arc<dyn Lockable>],
        access: AccessType,
        timeout: Duration,
    ) -> LockResult<()> {
        for lockable in lockables {
            let handle = self.lock_with_timeout(
                std::slice::from_ref(lockable),
                access,
                LockingMode::Shared,
                Some(timeout),
            )?;
            let waited = handle.wait_all(Some(timeout));
            let released = handle.release();
            waited.and(released)?;
        }
        Ok(())
    }

    /// True iff the resource has a non-empty queue. The probe does not take
    /// any queue monitor.
    pub fn is_locked(&self, lockable: &dyn Lockable) -> bool {
        self.queues
            .get(&lockable.lockable_id())
            .map_or(false, |queue| !queue.is_empty())
    }

    pub fn queue_len(&self, lockable: &dyn Lockable) -> usize {
        self.queues
            .get(&lockable.lockable_id())
            .map_or(0, |queue| queue.len())
    }

    /// Number of issued handles not yet released.
    pub fn open_handles(&self) -> usize {
        self.open_handles.lock().len()
    }

    pub(crate) fn forget(&self, handle_id: u64) {
        self.open_handles.lock().remove(&handle_id);
    }

    fn queue_for(&self, lockable: &Arc<dyn Lockable>) -> Arc<LockingQueue> {
        // The map shard guard is dropped before the caller blocks in the queue.
        self.queues
            .entry(lockable.lockable_id())
            .or_insert_with(|| LockingQueue::new(Arc::clone(lockable)))
            .clone()
    }
}
