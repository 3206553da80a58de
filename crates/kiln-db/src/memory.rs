//! In-memory implementation of [`RecordStore`].
//!
//! [`InMemoryRecordStore`] is a first-class backend for tests and for
//! engines that do not need persistence. Clones share the same storage, so
//! a test can drop a [`crate::Database`] and reopen a new one over the same
//! "disk", or inspect exactly what was committed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use kiln_core::{DepNode, QueryKey, Revision};

use crate::error::StorageError;
use crate::record::{ChangeSet, InputState, QueryRecord, Snapshot};
use crate::traits::RecordStore;

#[derive(Debug, Default)]
struct Stored {
    revision: Option<Revision>,
    records: BTreeMap<QueryKey, QueryRecord>,
    inputs: BTreeMap<DepNode, InputState>,
    commits: usize,
    /// Failures returned by upcoming commits, front first.
    injected: VecDeque<StorageError>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<Stored>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(&self) -> MutexGuard<'_, Stored> {
        // Commits apply a fully built change set, so poisoning is harmless.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` commits fail with a lock-contention error.
    pub fn fail_next_commits(&self, count: usize) {
        let mut stored = self.stored();
        for _ in 0..count {
            stored.injected.push_back(StorageError::Backend {
                reason: "database is locked".into(),
                transient: true,
            });
        }
    }

    /// Makes the next commit fail with a non-retryable error.
    pub fn fail_next_commit_fatally(&self, reason: &str) {
        self.stored().injected.push_back(StorageError::Backend {
            reason: reason.to_string(),
            transient: false,
        });
    }

    /// Number of commits applied successfully.
    pub fn commit_count(&self) -> usize {
        self.stored().commits
    }

    /// The committed record for `key`, if any.
    pub fn record(&self, key: &QueryKey) -> Option<QueryRecord> {
        self.stored().records.get(key).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.stored().records.len()
    }

    pub fn revision(&self) -> Option<Revision> {
        self.stored().revision
    }
}

impl RecordStore for InMemoryRecordStore {
    fn load(&self) -> Result<Snapshot, StorageError> {
        let stored = self.stored();
        Ok(Snapshot {
            revision: stored.revision,
            records: stored.records.values().cloned().collect(),
            inputs: stored.inputs.values().cloned().collect(),
        })
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<(), StorageError> {
        let mut stored = self.stored();
        if let Some(err) = stored.injected.pop_front() {
            return Err(err);
        }
        if let Some(revision) = changes.revision {
            stored.revision = Some(revision);
        }
        for key in &changes.removed_records {
            stored.records.remove(key);
        }
        for record in &changes.records {
            stored.records.insert(record.key.clone(), record.clone());
        }
        for (key, revision) in &changes.dirtied {
            if let Some(record) = stored.records.get_mut(key) {
                record.dirty = true;
                record.dirtied_at = Some(*revision);
            }
        }
        for node in &changes.removed_inputs {
            stored.inputs.remove(node);
        }
        for input in &changes.inputs {
            stored.inputs.insert(input.node.clone(), input.clone());
        }
        stored.commits += 1;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
