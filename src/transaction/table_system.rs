//! The storage-side collaborator a transaction commits through.

use std::sync::Arc;

use log::debug;

use super::error::{Result, TransactionError};
use super::manager::Transaction;

/// Applies or discards the changes of a transaction.
///
/// Implementations validate the transaction's registered changes against
/// concurrently committed work and fail the commit on irrecoverable
/// conflicts.
pub trait TableSystem: Send + Sync {
    fn commit(&self, transaction: &Transaction) -> Result<()>;

    fn rollback(&self, transaction: &Transaction) -> Result<()>;
}

/// A table system that keeps no rows and only performs commit-time conflict
/// detection on event registries.
///
/// On commit the transaction's registry is first checked for rows it removes
/// twice, then tested against every registry committed after the
/// transaction's snapshot. On success it is sealed with a new commit id and
/// added to the database history.
#[derive(Debug, Default)]
pub struct RegistryValidator;

impl RegistryValidator {
    pub fn new() -> Self {
        Self
    }
}

impl TableSystem for RegistryValidator {
    fn commit(&self, transaction: &Transaction) -> Result<()> {
        let database = transaction.database()?;
        let registry = transaction.registry();
        if registry.is_read_only() {
            return Err(TransactionError::RegistryReadOnly(registry.commit_id()));
        }

        if let Some(clash) = registry.commit_clash() {
            debug!(
                "transaction {} removes row {} of {} twice",
                transaction.commit_id(),
                clash.row_number,
                clash.table_id
            );
            return Err(TransactionError::CommitClash {
                table_id: clash.table_id,
                row_number: clash.row_number,
            });
        }

        let history = database.versioned_registry();
        let _commits = database.lock_commits();

        for committed in history.find_since_commit(transaction.commit_id().next()) {
            if let Some(clash) = registry.test_commit_clash(&committed) {
                debug!(
                    "transaction {} clashes with {} on row {} of {}",
                    transaction.commit_id(),
                    committed.commit_id(),
                    clash.row_number,
                    clash.table_id
                );
                return Err(TransactionError::CommitClash {
                    table_id: clash.table_id,
                    row_number: clash.row_number,
                });
            }
        }

        let commit_id = database.next_commit_id();
        registry.seal(commit_id)?;
        history.add(Arc::clone(registry));
        debug!(
            "transaction {} committed as {} with {} events",
            transaction.commit_id(),
            commit_id,
            registry.len()
        );
        Ok(())
    }

    fn rollback(&self, transaction: &Transaction) -> Result<()> {
        transaction.registry().clear()
    }
}
