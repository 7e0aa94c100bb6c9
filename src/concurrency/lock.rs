//! Locks on lockable resources.
//!
//! A [`Lock`] is one acquirable unit bound to a resource and an access type.
//! Locks are created by a [`LockingQueue`](super::queue::LockingQueue), which
//! owns the per-resource reader/writer state the lock is granted against.
//! Acquisition happens in two phases: the mode-based grant in
//! [`Lock::acquire`] and the queue-position wait performed later through the
//! owning [`LockHandle`](super::handle::LockHandle).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;

use super::error::{LockError, LockResult};
use super::queue::LockingQueue;

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockingMode {
    /// Shared lock, coexists with other shared holders.
    Shared,
    /// Exclusive lock, excludes every other holder.
    Exclusive,
}

impl LockingMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockingMode) -> bool {
        matches!((self, other), (LockingMode::Shared, LockingMode::Shared))
    }
}

impl fmt::Display for LockingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "Shared"),
            Self::Exclusive => write!(f, "Exclusive"),
        }
    }
}

bitflags! {
    /// The kind of access a lock protects. Requests may combine both flags;
    /// each individual [`Lock`] carries exactly one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessType: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AccessType {
    /// Whether this is exactly one of `READ` or `WRITE`.
    pub fn is_single(&self) -> bool {
        *self == Self::READ || *self == Self::WRITE
    }
}

/// Stable reference id of a lockable resource, used as the locker's map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockableId(pub u64);

impl LockableId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object{}", self.0)
    }
}

/// A table-like entity that can be targeted by shared/exclusive locking.
///
/// The callbacks run synchronously on the locking thread, outside the queue
/// monitor, so implementations may inspect the lock but must not block on it.
pub trait Lockable: Send + Sync {
    fn lockable_id(&self) -> LockableId;

    /// Called when a lock on this resource is created and queued.
    fn locked(&self, _lock: &Lock) {}

    /// Called when a lock on this resource leaves its queue.
    fn unlocked(&self, _lock: &Lock) {}
}

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// One lock held (or awaited) on a resource.
pub struct Lock {
    id: u64,
    owner: u64,
    resource: LockableId,
    mode: LockingMode,
    access: AccessType,
    queue: Weak<LockingQueue>,
    acquired: AtomicBool,
    released: AtomicBool,
    checked: AtomicBool,
}

impl Lock {
    pub(crate) fn new(
        queue: Weak<LockingQueue>,
        resource: LockableId,
        owner: u64,
        mode: LockingMode,
        access: AccessType,
    ) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            resource,
            mode,
            access,
            queue,
            acquired: AtomicBool::new(false),
            released: AtomicBool::new(false),
            checked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the handle this lock was acquired for.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn resource(&self) -> LockableId {
        self.resource
    }

    pub fn mode(&self) -> LockingMode {
        self.mode
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether the queue-position wait has completed for this lock.
    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Blocks until the mode-based grant succeeds or `timeout` expires.
    /// `None` waits indefinitely.
    pub fn acquire(&self, timeout: Option<Duration>) -> LockResult<()> {
        self.queue()?.acquire(self, timeout)
    }

    /// Releases the lock and removes it from its queue.
    ///
    /// A lock transitions to released exactly once; a second call is an
    /// over-release.
    pub fn release(&self) -> LockResult<()> {
        self.queue()?.release(self)
    }

    /// Blocks until this lock has reached its turn in the queue.
    pub fn wait(&self, access: AccessType, timeout: Duration) -> LockResult<()> {
        self.queue()?.wait(self, access, timeout)
    }

    fn queue(&self) -> LockResult<Arc<LockingQueue>> {
        self.queue
            .upgrade()
            .ok_or(LockError::QueueDropped(self.resource))
    }

    pub(crate) fn mark_acquired(&self) {
        self.acquired.store(true, Ordering::Release);
    }

    /// Returns the previous released flag.
    pub(crate) fn mark_released(&self) -> bool {
        self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_checked(&self) {
        self.checked.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("access", &self.access)
            .field("acquired", &self.is_acquired())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_compatibility() {
        assert!(LockingMode::Shared.is_compatible_with(&LockingMode::Shared));
        assert!(!LockingMode::Shared.is_compatible_with(&LockingMode::Exclusive));
        assert!(!LockingMode::Exclusive.is_compatible_with(&LockingMode::Shared));
        assert!(!LockingMode::Exclusive.is_compatible_with(&LockingMode::Exclusive));
    }

    #[test]
    fn test_access_type_flags() {
        let both = AccessType::READ | AccessType::WRITE;
        assert_eq!(both, AccessType::READ_WRITE);
        assert!(both.contains(AccessType::READ));
        assert!(both.contains(AccessType::WRITE));
        assert!(!both.is_single());
        assert!(AccessType::READ.is_single());
        assert!(AccessType::WRITE.is_single());
        assert!(!AccessType::empty().is_single());
    }

    #[test]
    fn test_lockable_id_display() {
        assert_eq!(format!("{}", LockableId::new(7)), "Object7");
        assert_eq!(LockableId::new(7).value(), 7);
    }

    #[test]
    fn test_orphan_lock_reports_dropped_queue() {
        let lock = Lock::new(
            Weak::new(),
            LockableId::new(3),
            1,
            LockingMode::Shared,
            AccessType::READ,
        );
        assert_eq!(
            lock.acquire(None),
            Err(LockError::QueueDropped(LockableId::new(3)))
        );
        assert!(!lock.is_acquired());
        assert!(!lock.is_released());
    }
}
