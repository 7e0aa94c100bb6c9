//! Transaction layer error types.

use thiserror::Error;

use crate::concurrency::LockError;
use crate::event::TableId;

use super::id::CommitId;

/// Errors that can occur while running a transaction.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Transactions require an explicit isolation level")]
    UnspecifiedIsolation,

    #[error("Savepoint '{0}' requested but savepoints are not supported")]
    SavepointUnsupported(String),

    #[error("Commit clash on row {row_number} of {table_id}")]
    CommitClash { table_id: TableId, row_number: u64 },

    #[error("Event registry of commit {0} is read-only")]
    RegistryReadOnly(CommitId),

    #[error("Transaction {0} is already closed")]
    Closed(CommitId),

    #[error("The database of transaction {0} was dropped")]
    DatabaseDropped(CommitId),

    #[error("The table system of transaction {0} was dropped")]
    TableSystemDropped(CommitId),

    #[error(transparent)]
    TableSystem(#[from] anyhow::Error),
}

impl TransactionError {
    /// Timeouts and commit clashes are worth retrying with a new
    /// transaction; everything else needs a fix in the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(e) => e.is_retryable(),
            Self::CommitClash { .. } => true,
            _ => false,
        }
    }
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
