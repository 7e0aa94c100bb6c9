//! Transaction lifecycle: locking on entry, commit and rollback.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};

use super::error::{Result, TransactionError};
use super::id::CommitId;
use super::isolation::IsolationLevel;
use super::state::{TableVersion, TransactionState, TransactionStatus};
use super::table_system::TableSystem;
use crate::concurrency::{AccessType, LockHandle, Lockable, LockableId, LockingMode};
use crate::database::Database;
use crate::event::{
    ObjectEvent, ObjectKind, ObjectName, RowEvent, RowEventKind, TableEvent, TableEventRegistry,
    TableId,
};

/// An event raised by a transaction, as seen by its listeners.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub commit_id: CommitId,
    pub isolation: IsolationLevel,
    pub event: TableEvent,
    metadata: BTreeMap<String, String>,
}

impl TransactionEvent {
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Receives the events of the transactions it is attached to.
pub trait TransactionEventListener: Send + Sync {
    fn on_event(&self, event: &TransactionEvent);
}

/// A unit of work against one database.
///
/// Locks taken through [`Transaction::enter`] or [`Transaction::lock`] are
/// held until the transaction commits or rolls back. A transaction dropped
/// while still open rolls back.
pub struct Transaction {
    commit_id: CommitId,
    isolation: IsolationLevel,
    status: TransactionStatus,
    closed: bool,
    state: TransactionState,
    registry: Arc<TableEventRegistry>,
    handles: Vec<LockHandle>,
    listeners: Vec<Arc<dyn TransactionEventListener>>,
    database: Weak<Database>,
    table_system: Weak<dyn TableSystem>,
    acquire_timeout: Option<Duration>,
    wait_timeout: Duration,
}

impl Transaction {
    /// Starts a transaction seeing the database as of `commit_id`.
    pub fn new(
        database: &Arc<Database>,
        table_system: &Arc<dyn TableSystem>,
        commit_id: CommitId,
        isolation: IsolationLevel,
        visible_tables: Vec<TableVersion>,
    ) -> Result<Self> {
        if !isolation.is_specified() {
            return Err(TransactionError::UnspecifiedIsolation);
        }

        let config = database.config();
        database.register_open(commit_id);
        debug!("started transaction {} at {}", commit_id, isolation);

        Ok(Self {
            commit_id,
            isolation,
            status: TransactionStatus::Started,
            closed: false,
            state: TransactionState::new(visible_tables),
            registry: Arc::new(TableEventRegistry::new(commit_id)),
            handles: Vec::new(),
            listeners: Vec::new(),
            database: Arc::downgrade(database),
            table_system: Arc::downgrade(table_system),
            acquire_timeout: config.locking.acquire_timeout(),
            wait_timeout: config.locking.wait_timeout(),
        })
    }

    /// Id of the latest commit visible to this transaction.
    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<TableEventRegistry> {
        &self.registry
    }

    pub fn lock_handles(&self) -> &[LockHandle] {
        &self.handles
    }

    pub fn database(&self) -> Result<Arc<Database>> {
        self.database
            .upgrade()
            .ok_or(TransactionError::DatabaseDropped(self.commit_id))
    }

    pub fn add_listener(&mut self, listener: Arc<dyn TransactionEventListener>) {
        self.listeners.push(listener);
    }

    /// Read-only metadata attached to every event of this transaction.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("commit_id".to_string(), self.commit_id.value().to_string()),
            ("isolation".to_string(), self.isolation.to_string()),
        ])
    }

    /// Whether one of this transaction's handles covers `access` on `id`.
    pub fn holds(&self, id: LockableId, access: AccessType) -> bool {
        self.handles.iter().any(|handle| handle.holds(id, access))
    }

    /// Prepares `objects` for `access` according to the isolation level.
    ///
    /// Objects this transaction already write-locked are skipped. If any of
    /// the rest is locked elsewhere, the transaction first waits until it
    /// could read them (`ReadCommitted`) or read and write them (`Snapshot`,
    /// `Serializable`); `ReadUncommitted` does not wait. Write access then
    /// takes an exclusive write lock held until the transaction ends.
    pub fn enter(&mut self, objects: &[Arc<dyn Lockable>], access: AccessType) -> Result<()> {
        self.ensure_open()?;
        let database = self.database()?;
        let locker = database.locker();

        let pending: Vec<Arc<dyn Lockable>> = objects
            .iter()
            .filter(|object| !self.holds(object.lockable_id(), AccessType::WRITE))
            .cloned()
            .collect();

        if pending.iter().any(|object| locker.is_locked(object.as_ref())) {
            let check = match self.isolation {
                IsolationLevel::ReadCommitted => Some(AccessType::READ),
                IsolationLevel::Snapshot | IsolationLevel::Serializable => {
                    Some(AccessType::READ_WRITE)
                }
                IsolationLevel::ReadUncommitted | IsolationLevel::Unspecified => None,
            };
            if let Some(check) = check {
                debug!(
                    "transaction {} waiting for {:?} access to {} objects",
                    self.commit_id,
                    check,
                    pending.len()
                );
                locker.check_access(&pending, check, self.wait_timeout)?;
            }
        }

        if access.contains(AccessType::WRITE) && !pending.is_empty() {
            let handle = locker.lock_with_timeout(
                &pending,
                AccessType::WRITE,
                LockingMode::Exclusive,
                self.acquire_timeout,
            )?;
            handle.wait_all(Some(self.wait_timeout))?;
            self.handles.push(handle);
        }

        for object in objects {
            let id = object.lockable_id();
            if access.contains(AccessType::WRITE) {
                self.state.add_accessed_table(id);
            }
            if access.contains(AccessType::READ) {
                self.state.add_selected_table(id);
            }
        }
        Ok(())
    }

    /// Locks `objects` directly and waits for queue position. The handle is
    /// held until the transaction ends.
    pub fn lock(
        &mut self,
        objects: &[Arc<dyn Lockable>],
        access: AccessType,
        mode: LockingMode,
    ) -> Result<&LockHandle> {
        self.ensure_open()?;
        let database = self.database()?;
        let handle =
            database
                .locker()
                .lock_with_timeout(objects, access, mode, self.acquire_timeout)?;
        handle.wait_all(Some(self.wait_timeout))?;
        self.handles.push(handle);
        Ok(&self.handles[self.handles.len() - 1])
    }

    pub fn on_row_added(&self, table_id: TableId, row_number: u64) -> Result<()> {
        self.register_event(RowEvent::new(table_id, row_number, RowEventKind::Add).into())
    }

    pub fn on_row_removed(&self, table_id: TableId, row_number: u64) -> Result<()> {
        self.register_event(RowEvent::new(table_id, row_number, RowEventKind::Remove).into())
    }

    /// An update removes the old row and adds the new one.
    pub fn on_row_updated(&self, table_id: TableId, old_row: u64, new_row: u64) -> Result<()> {
        self.register_event(RowEvent::new(table_id, old_row, RowEventKind::UpdateRemove).into())?;
        self.register_event(RowEvent::new(table_id, new_row, RowEventKind::UpdateAdd).into())
    }

    pub fn on_object_created(&self, name: ObjectName, kind: ObjectKind) -> Result<()> {
        self.register_event(ObjectEvent::Created { name, kind }.into())
    }

    pub fn on_object_dropped(&self, name: ObjectName, kind: ObjectKind) -> Result<()> {
        self.register_event(ObjectEvent::Dropped { name, kind }.into())
    }

    pub fn on_constraint_altered(&self, table_id: TableId) -> Result<()> {
        self.register_event(ObjectEvent::ConstraintAltered { table_id }.into())
    }

    /// Appends `event` to the registry and forwards it to the listeners.
    pub fn register_event(&self, event: TableEvent) -> Result<()> {
        self.ensure_open()?;
        self.registry.register(event.clone())?;

        if !self.listeners.is_empty() {
            let event = TransactionEvent {
                commit_id: self.commit_id,
                isolation: self.isolation,
                event,
                metadata: self.metadata(),
            };
            for listener in &self.listeners {
                listener.on_event(&event);
            }
        }
        Ok(())
    }

    /// Commits through the table system, then releases every lock.
    ///
    /// A no-op on a closed transaction. A table system error is returned
    /// after the locks have been released.
    pub fn commit(&mut self, save_point: Option<&str>) -> Result<()> {
        check_save_point(save_point)?;
        if self.closed {
            return Ok(());
        }

        self.status = TransactionStatus::Commit;
        let result = self.table_system().and_then(|system| system.commit(self));
        match &result {
            Ok(()) => debug!("transaction {} committed", self.commit_id),
            Err(e) => debug!("transaction {} failed to commit: {}", self.commit_id, e),
        }
        self.finish();
        result
    }

    /// Discards the changes through the table system, then releases every
    /// lock.
    pub fn rollback(&mut self, save_point: Option<&str>) -> Result<()> {
        check_save_point(save_point)?;
        if self.closed {
            return Ok(());
        }

        self.status = TransactionStatus::Rollback;
        let result = self.table_system().and_then(|system| system.rollback(self));
        debug!("transaction {} rolled back", self.commit_id);
        self.finish();
        result
    }

    fn table_system(&self) -> Result<Arc<dyn TableSystem>> {
        self.table_system
            .upgrade()
            .ok_or(TransactionError::TableSystemDropped(self.commit_id))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.status.is_finished() {
            return Err(TransactionError::Closed(self.commit_id));
        }
        Ok(())
    }

    /// Releases every lock handle and table version and marks the
    /// transaction closed. Release failures are logged, never returned.
    fn finish(&mut self) {
        for handle in self.handles.drain(..).rev() {
            if let Err(e) = handle.release() {
                warn!(
                    "transaction {} failed to release lock handle {}: {}",
                    self.commit_id,
                    handle.id(),
                    e
                );
            }
        }
        self.state.release_all();
        if let Some(database) = self.database.upgrade() {
            database.transaction_finished(self.commit_id);
        }
        self.closed = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            // Best effort rollback
            if let Err(e) = self.rollback(None) {
                warn!("rollback of dropped transaction {} failed: {}", self.commit_id, e);
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("commit_id", &self.commit_id)
            .field("isolation", &self.isolation)
            .field("status", &self.status)
            .field("closed", &self.closed)
            .field("handles", &self.handles.len())
            .finish()
    }
}

fn check_save_point(save_point: Option<&str>) -> Result<()> {
    match save_point {
        Some(name) if !name.is_empty() => {
            Err(TransactionError::SavepointUnsupported(name.to_string()))
        }
        _ => Ok(()),
    }
}
