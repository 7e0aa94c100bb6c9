//! Per-transaction log of table events.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::{ObjectEvent, RowEvent, RowEventKind, TableEvent, TableId};
use crate::transaction::error::{Result, TransactionError};
use crate::transaction::CommitId;

/// Two distinct removals of the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitClash {
    pub table_id: TableId,
    pub row_number: u64,
}

struct RegistryInner {
    commit_id: CommitId,
    events: Vec<TableEvent>,
    read_only: bool,
}

/// Append-only event log of one transaction.
///
/// One mutex covers both appends and reads so every reader sees a
/// consistent ordered snapshot. Once sealed at commit the registry is
/// immutable.
pub struct TableEventRegistry {
    inner: Mutex<RegistryInner>,
}

impl TableEventRegistry {
    pub fn new(commit_id: CommitId) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                commit_id,
                events: Vec::new(),
                read_only: false,
            }),
        }
    }

    pub fn commit_id(&self) -> CommitId {
        self.inner.lock().commit_id
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Snapshot of all events in registration order.
    pub fn events(&self) -> Vec<TableEvent> {
        self.inner.lock().events.clone()
    }

    /// Appends an event.
    ///
    /// Creating and dropping the same object within one registry cancel each
    /// other out, in either order.
    pub fn register(&self, event: impl Into<TableEvent>) -> Result<()> {
        let event = event.into();
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(TransactionError::RegistryReadOnly(inner.commit_id));
        }

        if let TableEvent::Object(object_event) = &event {
            let opposite = match object_event {
                ObjectEvent::Created { name, kind } => Some(ObjectEvent::Dropped {
                    name: name.clone(),
                    kind: *kind,
                }),
                ObjectEvent::Dropped { name, kind } => Some(ObjectEvent::Created {
                    name: name.clone(),
                    kind: *kind,
                }),
                ObjectEvent::ConstraintAltered { .. } => None,
            };
            if let Some(opposite) = opposite.map(TableEvent::Object) {
                if let Some(index) = inner.events.iter().rposition(|e| *e == opposite) {
                    inner.events.remove(index);
                    return Ok(());
                }
            }
        }

        inner.events.push(event);
        Ok(())
    }

    /// Marks the registry as committed under `commit_id`.
    pub fn seal(&self, commit_id: CommitId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(TransactionError::RegistryReadOnly(inner.commit_id));
        }
        inner.commit_id = commit_id;
        inner.read_only = true;
        Ok(())
    }

    /// Drops every pending event.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(TransactionError::RegistryReadOnly(inner.commit_id));
        }
        inner.events.clear();
        Ok(())
    }

    /// Rows of `table_id` added and not removed again afterwards.
    pub fn added_rows(&self, table_id: TableId) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut rows = Vec::new();
        for event in row_events(&inner.events, table_id) {
            if event.kind.is_add() {
                rows.push(event.row_number);
            } else if let Some(index) = rows.iter().position(|row| *row == event.row_number) {
                rows.remove(index);
            }
        }
        rows
    }

    /// Rows of `table_id` with any removal event.
    pub fn removed_rows(&self, table_id: TableId) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut rows = Vec::new();
        for event in row_events(&inner.events, table_id) {
            if event.kind.is_remove() && !rows.contains(&event.row_number) {
                rows.push(event.row_number);
            }
        }
        rows
    }

    /// Tables with at least one row event, in first-touch order.
    pub fn touched_tables(&self) -> Vec<TableId> {
        let inner = self.inner.lock();
        let mut tables = Vec::new();
        for event in &inner.events {
            if let TableEvent::Row(row) = event {
                if !tables.contains(&row.table_id) {
                    tables.push(row.table_id);
                }
            }
        }
        tables
    }

    pub fn object_events(&self) -> Vec<ObjectEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                TableEvent::Object(object) => Some(object.clone()),
                TableEvent::Row(_) => None,
            })
            .collect()
    }

    /// First row removed by two distinct `Remove` events of this registry.
    pub fn commit_clash(&self) -> Option<CommitClash> {
        let events = self.inner.lock().events.clone();
        first_double_remove(removals(&events))
    }

    /// First row removed twice within this registry, or removed both here and
    /// in `changes`. Duplicates inside `changes` alone are not reported.
    pub fn test_commit_clash(&self, changes: &TableEventRegistry) -> Option<CommitClash> {
        if std::ptr::eq(self, changes) {
            return self.commit_clash();
        }
        // Snapshot one side at a time so two registries never lock each other.
        let ours = self.inner.lock().events.clone();
        let theirs = changes.inner.lock().events.clone();

        if let Some(clash) = first_double_remove(removals(&ours)) {
            return Some(clash);
        }
        let theirs: HashSet<(TableId, u64)> = removals(&theirs).collect();
        let clash = removals(&ours)
            .find(|key| theirs.contains(key))
            .map(|(table_id, row_number)| CommitClash {
                table_id,
                row_number,
            });
        clash
    }
}

impl std::fmt::Debug for TableEventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TableEventRegistry")
            .field("commit_id", &inner.commit_id)
            .field("events", &inner.events.len())
            .field("read_only", &inner.read_only)
            .finish()
    }
}

fn row_events(events: &[TableEvent], table_id: TableId) -> impl Iterator<Item = &RowEvent> {
    events.iter().filter_map(move |event| match event {
        TableEvent::Row(row) if row.table_id == table_id => Some(row),
        _ => None,
    })
}

fn removals(events: &[TableEvent]) -> impl Iterator<Item = (TableId, u64)> + '_ {
    events.iter().filter_map(|event| match event {
        TableEvent::Row(row) if row.kind == RowEventKind::Remove => {
            Some((row.table_id, row.row_number))
        }
        _ => None,
    })
}

fn first_double_remove(removals: impl Iterator<Item = (TableId, u64)>) -> Option<CommitClash> {
    let mut seen = HashSet::new();
    for key in removals {
        if !seen.insert(key) {
            return Some(CommitClash {
                table_id: key.0,
                row_number: key.1,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ObjectKind, ObjectName};

    const T1: TableId = TableId(1);
    const T2: TableId = TableId(2);

    fn row(table_id: TableId, row_number: u64, kind: RowEventKind) -> RowEvent {
        RowEvent::new(table_id, row_number, kind)
    }

    #[test]
    fn test_added_and_removed_rows() {
        let registry = TableEventRegistry::new(CommitId::new(1));
        registry.register(row(T1, 1, RowEventKind::Add)).unwrap();
        registry.register(row(T1, 2, RowEventKind::Add)).unwrap();
        registry.register(row(T1, 1, RowEventKind::Remove)).unwrap();

        assert_eq!(registry.added_rows(T1), vec![2]);
        assert_eq!(registry.removed_rows(T1), vec![1]);
        assert!(registry.added_rows(T2).is_empty());
        assert_eq!(registry.touched_tables(), vec![T1]);
    }

    #[test]
    fn test_update_events() {
        let registry = TableEventRegistry::new(CommitId::new(1));
        registry.register(row(T1, 4, RowEventKind::UpdateRemove)).unwrap();
        registry.register(row(T1, 9, RowEventKind::UpdateAdd)).unwrap();
        registry.register(row(T2, 3, RowEventKind::Add)).unwrap();
        registry.register(row(T2, 3, RowEventKind::UpdateRemove)).unwrap();
        registry.register(row(T2, 5, RowEventKind::UpdateAdd)).unwrap();

        assert_eq!(registry.added_rows(T1), vec![9]);
        assert_eq!(registry.removed_rows(T1), vec![4]);
        assert_eq!(registry.added_rows(T2), vec![5]);
        assert_eq!(registry.removed_rows(T2), vec![3]);
        assert_eq!(registry.touched_tables(), vec![T1, T2]);
    }

    #[test]
    fn test_commit_clash_within_registry() {
        let registry = TableEventRegistry::new(CommitId::new(1));
        registry.register(row(T1, 5, RowEventKind::Remove)).unwrap();
        assert_eq!(registry.commit_clash(), None);
        assert_eq!(registry.test_commit_clash(&registry), None);

        registry.register(row(T1, 5, RowEventKind::Remove)).unwrap();
        let clash = CommitClash {
            table_id: T1,
            row_number: 5,
        };
        assert_eq!(registry.commit_clash(), Some(clash));
        assert_eq!(registry.test_commit_clash(&registry), Some(clash));
    }

    #[test]
    fn test_commit_clash_across_registries() {
        let ours = TableEventRegistry::new(CommitId::new(1));
        let theirs = TableEventRegistry::new(CommitId::new(2));
        ours.register(row(T1, 5, RowEventKind::Remove)).unwrap();
        theirs.register(row(T2, 5, RowEventKind::Remove)).unwrap();
        theirs.register(row(T1, 6, RowEventKind::UpdateRemove)).unwrap();
        assert_eq!(ours.test_commit_clash(&theirs), None);

        theirs.register(row(T1, 5, RowEventKind::Remove)).unwrap();
        assert_eq!(
            ours.test_commit_clash(&theirs),
            Some(CommitClash {
                table_id: T1,
                row_number: 5
            })
        );
    }

    #[test]
    fn test_duplicates_in_other_registry_do_not_clash() {
        let ours = TableEventRegistry::new(CommitId::new(1));
        let theirs = TableEventRegistry::new(CommitId::new(2));
        ours.register(row(T2, 7, RowEventKind::Remove)).unwrap();
        theirs.register(row(T1, 5, RowEventKind::Remove)).unwrap();
        theirs.register(row(T1, 5, RowEventKind::Remove)).unwrap();

        assert!(theirs.commit_clash().is_some());
        assert_eq!(ours.test_commit_clash(&theirs), None);

        // Our own duplicates still count.
        ours.register(row(T2, 7, RowEventKind::Remove)).unwrap();
        assert_eq!(
            ours.test_commit_clash(&theirs),
            Some(CommitClash {
                table_id: T2,
                row_number: 7
            })
        );
    }

    #[test]
    fn test_create_then_drop_cancels_out() {
        let registry = TableEventRegistry::new(CommitId::new(1));
        let name = ObjectName::new("app.users");
        registry
            .register(ObjectEvent::Created {
                name: name.clone(),
                kind: ObjectKind::Table,
            })
            .unwrap();
        registry
            .register(ObjectEvent::Dropped {
                name: name.clone(),
                kind: ObjectKind::Table,
            })
            .unwrap();
        assert!(registry.is_empty());

        registry
            .register(ObjectEvent::Dropped {
                name: name.clone(),
                kind: ObjectKind::View,
            })
            .unwrap();
        registry
            .register(ObjectEvent::Created {
                name: name.clone(),
                kind: ObjectKind::View,
            })
            .unwrap();
        assert!(registry.object_events().is_empty());

        registry
            .register(ObjectEvent::ConstraintAltered { table_id: T1 })
            .unwrap();
        assert_eq!(registry.object_events().len(), 1);
    }

    #[test]
    fn test_sealed_registry_is_read_only() {
        let registry = TableEventRegistry::new(CommitId::new(1));
        registry.register(row(T1, 1, RowEventKind::Add)).unwrap();
        registry.seal(CommitId::new(8)).unwrap();

        assert!(registry.is_read_only());
        assert_eq!(registry.commit_id(), CommitId::new(8));
        assert!(matches!(
            registry.register(row(T1, 2, RowEventKind::Add)),
            Err(TransactionError::RegistryReadOnly(_))
        ));
        assert!(registry.clear().is_err());
        assert!(registry.seal(CommitId::new(9)).is_err());
        assert_eq!(registry.len(), 1);
    }
}
