//! Concurrency control module.
//!
//! This module implements object-level locking for tablelock:
//! - Shared/exclusive locks bound to a resource and an access type
//! - Per-resource FIFO queues giving writers strict arrival-order fairness
//! - The locker registry and the scoped lock handles it issues

pub mod error;
pub mod handle;
pub mod lock;
pub mod locker;
pub mod queue;

pub use error::{LockError, LockResult};
pub use handle::{LockHandle, DEFAULT_WAIT_TIMEOUT};
pub use lock::{AccessType, Lock, Lockable, LockableId, LockingMode};
pub use locker::Locker;
pub use queue::LockingQueue;
