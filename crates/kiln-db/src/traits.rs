//! The [`RecordStore`] trait: the persistence contract for the dependency
//! database.
//!
//! The in-memory [`crate::Database`] is the source of truth while the
//! process runs; a backend only has to reload what was committed and apply
//! change sets atomically. Both backends ([`crate::SqliteRecordStore`] and
//! [`crate::InMemoryRecordStore`]) are swappable behind this trait.

use crate::error::StorageError;
use crate::record::{ChangeSet, Snapshot};

pub trait RecordStore: Send {
    /// Loads every committed record and input.
    fn load(&self) -> Result<Snapshot, StorageError>;

    /// Applies `changes` atomically: either all of it is durable afterwards
    /// or none of it is.
    fn commit(&mut self, changes: &ChangeSet) -> Result<(), StorageError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
