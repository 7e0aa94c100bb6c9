//! Database-wide history of committed event registries.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use super::registry::TableEventRegistry;
use crate::transaction::CommitId;

/// Committed registries ordered by commit id, kept until no pending commit
/// needs to reconcile against them.
#[derive(Default)]
pub struct VersionedTableEventRegistry {
    registries: Mutex<VecDeque<Arc<TableEventRegistry>>>,
}

impl VersionedTableEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a committed registry, keeping the history ordered by commit id.
    pub fn add(&self, registry: Arc<TableEventRegistry>) {
        let commit_id = registry.commit_id();
        let mut registries = self.registries.lock();
        let index = registries
            .iter()
            .rposition(|r| r.commit_id() <= commit_id)
            .map_or(0, |i| i + 1);
        registries.insert(index, registry);
    }

    /// Discards registries from the head while their commit id is at most
    /// `commit_id`. Returns true once the history is empty.
    pub fn merge_changes(&self, commit_id: CommitId) -> bool {
        let mut registries = self.registries.lock();
        while let Some(oldest) = registries.front() {
            if oldest.commit_id() > commit_id {
                return false;
            }
            trace!("merged event registry of commit {}", oldest.commit_id());
            registries.pop_front();
        }
        true
    }

    /// Every registry committed at or after `commit_id`.
    pub fn find_since_commit(&self, commit_id: CommitId) -> Vec<Arc<TableEventRegistry>> {
        self.registries
            .lock()
            .iter()
            .filter(|r| r.commit_id() >= commit_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.lock().is_empty()
    }
}
