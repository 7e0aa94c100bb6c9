//! Commit id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id ordering committed work. A transaction is created with the
/// id of the latest commit it can see and its registry is sealed with a
/// fresh id when it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(pub u64);

impl CommitId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Commit{}", self.0)
    }
}

/// A thread-safe commit id generator.
pub struct CommitIdGenerator {
    last: AtomicU64,
}

impl CommitIdGenerator {
    /// Creates a generator whose first issued id is 1.
    pub fn new() -> Self {
        Self::starting_after(CommitId::new(0))
    }

    pub fn starting_after(last: CommitId) -> Self {
        Self {
            last: AtomicU64::new(last.value()),
        }
    }

    /// Issues the next commit id.
    pub fn next(&self) -> CommitId {
        CommitId::new(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently issued id, 0 before the first commit.
    pub fn current(&self) -> CommitId {
        CommitId::new(self.last.load(Ordering::SeqCst))
    }
}

impl Default for CommitIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
