//! Transaction state management.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::concurrency::LockableId;
use crate::event::{ObjectName, TableId};

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The transaction is open and can perform operations.
    Started,
    /// The transaction committed (or is committing).
    Commit,
    /// The transaction rolled back (or is rolling back).
    Rollback,
}

impl TransactionStatus {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Returns true once a commit or rollback has been decided.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Commit => write!(f, "Commit"),
            Self::Rollback => write!(f, "Rollback"),
        }
    }
}

/// Opaque handle on one version of a table's storage.
pub trait TableSource: Send + Sync {
    fn table_id(&self) -> TableId;
    fn table_name(&self) -> ObjectName;
}

/// Opaque set of row indexes for one table version.
pub trait RowIndexSet: Send + Sync {
    /// Gives the set back to its owner once no transaction needs it.
    fn release(&self);
}

/// A table version visible to a transaction together with its index set.
#[derive(Clone)]
pub struct TableVersion {
    pub source: Arc<dyn TableSource>,
    pub indexes: Arc<dyn RowIndexSet>,
}

impl TableVersion {
    pub fn new(source: Arc<dyn TableSource>, indexes: Arc<dyn RowIndexSet>) -> Self {
        Self { source, indexes }
    }

    pub fn table_name(&self) -> ObjectName {
        self.source.table_name()
    }

    pub fn table_id(&self) -> TableId {
        self.source.table_id()
    }
}

impl std::fmt::Debug for TableVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableVersion")
            .field("table_id", &self.table_id())
            .field("table_name", &self.table_name())
            .finish()
    }
}

/// Per-transaction snapshot of table visibility.
///
/// Each sequence has its own mutex so unrelated bookkeeping never contends.
/// A table name maps to at most one visible version; replacing or removing
/// it queues the old version for cleanup.
#[derive(Default)]
pub struct TransactionState {
    visible: Mutex<Vec<TableVersion>>,
    selected: Mutex<Vec<LockableId>>,
    accessed: Mutex<Vec<LockableId>>,
    cleanup: Mutex<Vec<TableVersion>>,
}

impl TransactionState {
    pub fn new(visible_tables: impl IntoIterator<Item = TableVersion>) -> Self {
        let state = Self::default();
        for version in visible_tables {
            state.add_visible_table(version);
        }
        state
    }

    /// Makes `version` the visible version of its table.
    pub fn add_visible_table(&self, version: TableVersion) {
        let name = version.table_name();
        let replaced = {
            let mut visible = self.visible.lock();
            match visible.iter().position(|v| v.table_name() == name) {
                Some(index) => Some(std::mem::replace(&mut visible[index], version)),
                None => {
                    visible.push(version);
                    None
                }
            }
        };
        if let Some(old) = replaced {
            self.enqueue_cleanup(old);
        }
    }

    /// Replaces the visible version of an already visible table. Returns
    /// false, leaving the state untouched, when the table is not visible.
    pub fn update_visible_table(&self, version: TableVersion) -> bool {
        let name = version.table_name();
        let old = {
            let mut visible = self.visible.lock();
            let Some(index) = visible.iter().position(|v| v.table_name() == name) else {
                return false;
            };
            std::mem::replace(&mut visible[index], version)
        };
        self.enqueue_cleanup(old);
        true
    }

    pub fn remove_visible_table(&self, name: &ObjectName) -> bool {
        let removed = {
            let mut visible = self.visible.lock();
            let index = visible.iter().position(|v| &v.table_name() == name);
            index.map(|index| visible.remove(index))
        };
        match removed {
            Some(old) => {
                self.enqueue_cleanup(old);
                true
            }
            None => false,
        }
    }

    pub fn visible_table(&self, name: &ObjectName) -> Option<TableVersion> {
        self.visible
            .lock()
            .iter()
            .find(|v| &v.table_name() == name)
            .cloned()
    }

    pub fn visible_tables(&self) -> Vec<TableVersion> {
        self.visible.lock().clone()
    }

    pub fn contains_visible_table(&self, name: &ObjectName) -> bool {
        self.visible.lock().iter().any(|v| &v.table_name() == name)
    }

    pub fn add_selected_table(&self, id: LockableId) {
        let mut selected = self.selected.lock();
        if !selected.contains(&id) {
            selected.push(id);
        }
    }

    pub fn selected_tables(&self) -> Vec<LockableId> {
        self.selected.lock().clone()
    }

    pub fn add_accessed_table(&self, id: LockableId) {
        let mut accessed = self.accessed.lock();
        if !accessed.contains(&id) {
            accessed.push(id);
        }
    }

    pub fn accessed_tables(&self) -> Vec<LockableId> {
        self.accessed.lock().clone()
    }

    pub fn is_accessed(&self, id: LockableId) -> bool {
        self.accessed.lock().contains(&id)
    }

    pub fn cleanup_len(&self) -> usize {
        self.cleanup.lock().len()
    }

    /// Releases every superseded version. Returns how many were released.
    pub fn cleanup(&self) -> usize {
        let superseded = std::mem::take(&mut *self.cleanup.lock());
        for version in &superseded {
            version.indexes.release();
        }
        superseded.len()
    }

    /// Releases superseded and visible versions at transaction end.
    pub fn release_all(&self) -> usize {
        let visible = std::mem::take(&mut *self.visible.lock());
        for version in &visible {
            version.indexes.release();
        }
        visible.len() + self.cleanup()
    }

    fn enqueue_cleanup(&self, version: TableVersion) {
        trace!("queued {} for cleanup", version.table_name());
        self.cleanup.lock().push(version);
    }
}
