//! Table events recorded by transactions.
//!
//! Row mutations and object lifecycle changes are appended to a per
//! transaction [`TableEventRegistry`]; committed registries are kept in the
//! database-wide [`VersionedTableEventRegistry`] for commit-time conflict
//! detection.

pub mod registry;
pub mod versioned;

use std::fmt;

pub use registry::{CommitClash, TableEventRegistry};
pub use versioned::VersionedTableEventRegistry;

/// Numeric id of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table{}", self.0)
    }
}

/// Fully qualified name of a database object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName(String);

impl ObjectName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowEventKind {
    Add,
    Remove,
    /// The new row written by an update.
    UpdateAdd,
    /// The old row replaced by an update.
    UpdateRemove,
}

impl RowEventKind {
    pub fn is_add(&self) -> bool {
        matches!(self, Self::Add | Self::UpdateAdd)
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Self::Remove | Self::UpdateRemove)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowEvent {
    pub table_id: TableId,
    pub row_number: u64,
    pub kind: RowEventKind,
}

impl RowEvent {
    pub fn new(table_id: TableId, row_number: u64, kind: RowEventKind) -> Self {
        Self {
            table_id,
            row_number,
            kind,
        }
    }
}

/// Kind of object a lifecycle event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Table,
    View,
    Sequence,
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectEvent {
    Created { name: ObjectName, kind: ObjectKind },
    Dropped { name: ObjectName, kind: ObjectKind },
    ConstraintAltered { table_id: TableId },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableEvent {
    Row(RowEvent),
    Object(ObjectEvent),
}

impl From<RowEvent> for TableEvent {
    fn from(event: RowEvent) -> Self {
        Self::Row(event)
    }
}

impl From<ObjectEvent> for TableEvent {
    fn from(event: ObjectEvent) -> Self {
        Self::Object(event)
    }
}
