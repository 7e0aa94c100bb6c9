//! Transaction management module.
//!
//! This module provides transaction support for tablelock, including:
//! - Transaction lifecycle management (start, commit, rollback)
//! - Isolation levels and their mapping onto object locks
//! - Per-transaction table visibility state
//! - The table system seam commits are validated through

pub mod error;
pub mod id;
pub mod isolation;
pub mod manager;
pub mod state;
pub mod table_system;

// Re-export commonly used types
pub use error::{Result, TransactionError};
pub use id::{CommitId, CommitIdGenerator};
pub use isolation::IsolationLevel;
pub use manager::{Transaction, TransactionEvent, TransactionEventListener};
pub use state::{RowIndexSet, TableSource, TableVersion, TransactionState, TransactionStatus};
pub use table_system::{RegistryValidator, TableSystem};
