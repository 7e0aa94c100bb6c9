use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;
use parking_lot::{Mutex, MutexGuard};

use crate::concurrency::Locker;
use crate::config::Config;
use crate::event::VersionedTableEventRegistry;
use crate::transaction::{
    CommitId, CommitIdGenerator, IsolationLevel, Result, TableSystem, TableVersion, Transaction,
};

/// Shared concurrency-control context of one database.
///
/// Owns the locker, the commit id sequence, the history of committed event
/// registries and the snapshots of open transactions.
pub struct Database {
    config: Config,
    locker: Arc<Locker>,
    commit_ids: CommitIdGenerator,
    history: VersionedTableEventRegistry,
    /// Snapshot commit id -> number of open transactions started at it.
    open_snapshots: Mutex<BTreeMap<CommitId, usize>>,
    commit_lock: Mutex<()>,
}

impl Database {
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Arc<Self> {
        let locker = Locker::with_acquire_timeout(config.locking.acquire_timeout());
        Arc::new(Self {
            config,
            locker,
            commit_ids: CommitIdGenerator::new(),
            history: VersionedTableEventRegistry::new(),
            open_snapshots: Mutex::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub fn versioned_registry(&self) -> &VersionedTableEventRegistry {
        &self.history
    }

    /// Id of the most recent commit.
    pub fn latest_commit_id(&self) -> CommitId {
        self.commit_ids.current()
    }

    /// Issues the id for a commit being applied.
    pub fn next_commit_id(&self) -> CommitId {
        self.commit_ids.next()
    }

    /// Serializes commit validation: held while a table system checks a
    /// registry against the history and publishes it.
    pub fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Begins a transaction seeing every commit made so far.
    pub fn begin(
        self: &Arc<Self>,
        table_system: &Arc<dyn TableSystem>,
        isolation: IsolationLevel,
    ) -> Result<Transaction> {
        self.begin_with_tables(table_system, isolation, Vec::new())
    }

    /// Begins a transaction at the configured default isolation level.
    pub fn begin_default(self: &Arc<Self>, table_system: &Arc<dyn TableSystem>) -> Result<Transaction> {
        self.begin(table_system, self.config.transaction.default_isolation)
    }

    pub fn begin_with_tables(
        self: &Arc<Self>,
        table_system: &Arc<dyn TableSystem>,
        isolation: IsolationLevel,
        visible_tables: Vec<TableVersion>,
    ) -> Result<Transaction> {
        let _commits = self.lock_commits();
        Transaction::new(
            self,
            table_system,
            self.latest_commit_id(),
            isolation,
            visible_tables,
        )
    }

    pub fn open_transactions(&self) -> usize {
        self.open_snapshots.lock().values().sum()
    }

    /// Snapshot of the oldest open transaction.
    pub fn oldest_open_snapshot(&self) -> Option<CommitId> {
        self.open_snapshots.lock().keys().next().copied()
    }

    pub(crate) fn register_open(&self, snapshot: CommitId) {
        *self.open_snapshots.lock().entry(snapshot).or_insert(0) += 1;
    }

    /// Forgets one open transaction and drops history nobody needs anymore.
    pub(crate) fn transaction_finished(&self, snapshot: CommitId) {
        {
            let mut open = self.open_snapshots.lock();
            if let Some(count) = open.get_mut(&snapshot) {
                *count -= 1;
                if *count == 0 {
                    open.remove(&snapshot);
                }
            }
        }
        self.merge_history();
    }

    /// Discards committed registries no open transaction can clash with.
    /// Returns true when the history is empty afterwards.
    pub fn merge_history(&self) -> bool {
        let _commits = self.lock_commits();
        let horizon = self
            .oldest_open_snapshot()
            .unwrap_or_else(|| self.latest_commit_id());
        let merged = self.history.merge_changes(horizon);
        trace!("merged history up to {}, empty: {}", horizon, merged);
        merged
    }
}
