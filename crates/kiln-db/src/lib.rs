//! Persisted dependency database for the kiln query engine.
//!
//! Records map each [`kiln_core::QueryKey`] to its last value, the ordered
//! dependencies read while computing it, and the revision bookkeeping that
//! decides reuse. [`Database`] keeps the authoritative state in memory and
//! writes through a [`RecordStore`] backend: SQLite for real use, or the
//! in-memory store for tests.

pub mod database;
pub mod dirty;
pub mod error;
pub mod graph;
pub mod memory;
pub mod record;
pub mod retry;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use database::{Database, DbStats, Execution, GcReport, PutOutcome};
pub use dirty::InvalidationSet;
pub use error::StorageError;
pub use graph::DependencyGraph;
pub use memory::InMemoryRecordStore;
pub use record::{InputState, QueryRecord, WriteBatch};
pub use retry::RetryPolicy;
pub use sqlite::SqliteRecordStore;
pub use traits::RecordStore;
