//! The dependency database: memoized records, the reverse dependency index,
//! and the revision counter.
//!
//! The in-memory [`State`] behind an `RwLock` is authoritative while the
//! process runs. Writes reach the backend in two ways:
//!
//! - [`Database::put`] records a finished execution in memory and adds its
//!   key to the caller's [`WriteBatch`]; [`Database::commit`] later persists
//!   the whole batch in one backend transaction.
//! - [`Database::mark_dirty_many`] and [`Database::set_input`] persist
//!   immediately.
//!
//! Both persist while holding the state lock (commits under the read lock,
//! changes under the write lock), so the order of durable writes matches
//! the order of in-memory updates. Locks are always taken state first, then
//! backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use kiln_core::{ContentHash, DepNode, Dependency, QueryKey, Revision};

use crate::dirty::{dirty_closure, DependentsIndex, InvalidationSet};
use crate::error::StorageError;
use crate::graph::DependencyGraph;
use crate::memory::InMemoryRecordStore;
use crate::record::{ChangeSet, InputState, QueryRecord, Snapshot, WriteBatch};
use crate::retry::RetryPolicy;
use crate::sqlite::SqliteRecordStore;
use crate::traits::RecordStore;

/// A finished query execution, ready to be memoized.
#[derive(Debug, Clone)]
pub struct Execution {
    pub key: QueryKey,
    /// Canonical JSON of the result.
    pub value: Arc<str>,
    pub dependencies: Vec<Dependency>,
    pub outputs: Vec<ContentHash>,
    /// Revision current when the execution began.
    pub started_at: Revision,
}

/// What [`Database::put`] did with an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub value_hash: ContentHash,
    /// A dependency changed while the execution ran, so the record was
    /// stored dirty and will be recomputed on the next request.
    pub stale: bool,
    /// The value differs from the previously memoized one.
    pub changed: bool,
}

/// Result of [`Database::collect_garbage`].
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub removed_records: Vec<QueryKey>,
    pub removed_inputs: usize,
    /// Blobs still referenced by a surviving record or config input.
    pub live_blobs: HashSet<ContentHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub revision: Revision,
    pub records: usize,
    pub dirty_records: usize,
    pub inputs: usize,
    pub edges: usize,
}

struct State {
    revision: Revision,
    records: HashMap<QueryKey, QueryRecord>,
    inputs: HashMap<DepNode, InputState>,
    dependents: DependentsIndex,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State {
            revision: snapshot.revision.unwrap_or(Revision::INITIAL),
            records: HashMap::with_capacity(snapshot.records.len()),
            inputs: HashMap::with_capacity(snapshot.inputs.len()),
            dependents: DependentsIndex::new(),
        };
        for input in snapshot.inputs {
            state.inputs.insert(input.node.clone(), input);
        }
        for record in snapshot.records {
            state.link(&record);
            state.records.insert(record.key.clone(), record);
        }
        state
    }

    fn link(&mut self, record: &QueryRecord) {
        for dep in &record.dependencies {
            self.dependents
                .entry(dep.node.clone())
                .or_default()
                .insert(record.key.clone());
        }
    }

    fn unlink(&mut self, record: &QueryRecord) {
        for dep in &record.dependencies {
            if let Some(readers) = self.dependents.get_mut(&dep.node) {
                readers.remove(&record.key);
                if readers.is_empty() {
                    self.dependents.remove(&dep.node);
                }
            }
        }
    }

    fn dirtied_at(&self, node: &DepNode) -> Option<Revision> {
        match node {
            DepNode::Query(key) => self.records.get(key).and_then(|r| r.dirtied_at),
            leaf => self.inputs.get(leaf).and_then(|i| i.dirtied_at),
        }
    }

    /// False when `dep` is a leaf whose current fingerprint is known and
    /// equal to the one read.
    fn differs_from_read(&self, dep: &Dependency) -> bool {
        match &dep.node {
            DepNode::Query(_) => true,
            leaf => self.inputs.get(leaf).map_or(true, |input| {
                input.dirty || input.fingerprint != Some(dep.fingerprint)
            }),
        }
    }

    fn is_tracked(&self, node: &DepNode) -> bool {
        let known = match node {
            DepNode::Query(key) => self.records.contains_key(key),
            leaf => self.inputs.contains_key(leaf),
        };
        known || self.dependents.contains_key(node)
    }

    /// Deep validity check. Keys whose dependencies were all confirmed are
    /// pushed to `confirmed` so the caller can bump their `verified_at`.
    fn verify(
        &self,
        key: &QueryKey,
        visiting: &mut HashSet<QueryKey>,
        confirmed: &mut Vec<QueryKey>,
    ) -> bool {
        let Some(record) = self.records.get(key) else {
            return false;
        };
        if record.dirty {
            return false;
        }
        if record.verified_at == self.revision || !visiting.insert(key.clone()) {
            return true;
        }
        for dep in &record.dependencies {
            let ok = match &dep.node {
                DepNode::Query(child) => {
                    self.verify(child, visiting, confirmed)
                        && self
                            .records
                            .get(child)
                            .is_some_and(|c| c.value_hash == dep.fingerprint)
                }
                leaf => self.inputs.get(leaf).map_or(true, |input| {
                    !input.dirty && input.fingerprint.map_or(true, |f| f == dep.fingerprint)
                }),
            };
            if !ok {
                return false;
            }
        }
        confirmed.push(key.clone());
        true
    }

    /// Bumps the revision and dirties the closure of `changes`.
    ///
    /// A change carrying a fingerprint (a config input being set) records
    /// the new value as observed; one without only marks the node dirty.
    fn apply_changes(
        &mut self,
        changes: &[(DepNode, Option<ContentHash>)],
    ) -> (InvalidationSet, ChangeSet) {
        self.revision = self.revision.next();
        let revision = self.revision;
        let mut persisted = ChangeSet {
            revision: Some(revision),
            ..ChangeSet::default()
        };

        for (node, fingerprint) in changes {
            if node.is_leaf() {
                let input = self
                    .inputs
                    .entry(node.clone())
                    .or_insert_with(|| InputState {
                        node: node.clone(),
                        fingerprint: None,
                        dirty: false,
                        dirtied_at: None,
                    });
                match fingerprint {
                    Some(fingerprint) => {
                        input.fingerprint = Some(*fingerprint);
                        input.dirty = false;
                    }
                    None => input.dirty = true,
                }
                input.dirtied_at = Some(revision);
                persisted.inputs.push(input.clone());
            }
        }

        let dirtied = dirty_closure(changes.iter().map(|(node, _)| node), &self.dependents);
        for key in &dirtied {
            if let Some(record) = self.records.get_mut(key) {
                record.dirty = true;
                record.dirtied_at = Some(revision);
                // Uncommitted records reach the backend with their request.
                persisted.dirtied.push((key.clone(), revision));
            }
        }

        let set = InvalidationSet {
            revision,
            changed: changes.iter().map(|(node, _)| node.clone()).collect(),
            dirtied,
        };
        (set, persisted)
    }
}

/// The persisted dependency graph of memoized query results.
pub struct Database {
    state: RwLock<State>,
    backend: Mutex<Box<dyn RecordStore>>,
    retry: RetryPolicy,
}

impl Database {
    /// Loads every committed record from `backend`.
    pub fn open(
        backend: impl RecordStore + 'static,
        retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let snapshot = retry.run(|| backend.load())?;
        let state = State::from_snapshot(snapshot);
        info!(
            backend = backend.backend_name(),
            revision = %state.revision,
            records = state.records.len(),
            "opened dependency database"
        );
        Ok(Database {
            state: RwLock::new(state),
            backend: Mutex::new(Box::new(backend)),
            retry,
        })
    }

    /// Opens (or creates) an SQLite database file.
    pub fn open_sqlite(
        path: impl AsRef<std::path::Path>,
        retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let backend = retry.run(|| SqliteRecordStore::open(path.as_ref()))?;
        Self::open(backend, retry)
    }

    /// An empty database that persists nothing beyond the process.
    pub fn in_memory() -> Self {
        Database {
            state: RwLock::new(State::from_snapshot(Snapshot::default())),
            backend: Mutex::new(Box::new(InMemoryRecordStore::new())),
            retry: RetryPolicy::default(),
        }
    }

    // Poisoning is recovered from: every mutation of `State` completes
    // before any call that could panic.
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn backend(&self) -> MutexGuard<'_, Box<dyn RecordStore>> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, changes: &ChangeSet) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut backend = self.backend();
        self.retry.run(|| backend.commit(changes))
    }

    pub fn revision(&self) -> Revision {
        self.read().revision
    }

    pub fn get(&self, key: &QueryKey) -> Option<QueryRecord> {
        self.read().records.get(key).cloned()
    }

    /// Keys of every record whose query name is one of `names`, sorted.
    pub fn keys_named(&self, names: &[&str]) -> Vec<QueryKey> {
        let state = self.read();
        let mut keys: Vec<QueryKey> = state
            .records
            .keys()
            .filter(|key| names.contains(&key.name()))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// True if a record exists and is reusable at the current revision.
    ///
    /// A record verified at an older revision is reusable when every
    /// transitive dependency is clean and still carries the fingerprint it
    /// had when read; such records are re-stamped with the current revision
    /// in memory.
    pub fn is_valid(&self, key: &QueryKey) -> bool {
        self.valid_record(key).is_some()
    }

    /// The record for `key` if it is reusable, checked and read under one
    /// lock so a concurrent change cannot fall between the two.
    pub fn valid_record(&self, key: &QueryKey) -> Option<QueryRecord> {
        let (revision, record, confirmed) = {
            let state = self.read();
            let mut confirmed = Vec::new();
            if !state.verify(key, &mut HashSet::new(), &mut confirmed) {
                return None;
            }
            (state.revision, state.records.get(key).cloned()?, confirmed)
        };
        if confirmed.is_empty() {
            return Some(record);
        }

        let mut state = self.write();
        if state.revision == revision {
            for key in &confirmed {
                if let Some(record) = state.records.get_mut(key) {
                    if !record.dirty {
                        record.verified_at = revision;
                    }
                }
            }
        }
        Some(record)
    }

    /// True if any record reads `node`, or `node` has recorded state.
    pub fn is_tracked(&self, node: &DepNode) -> bool {
        self.read().is_tracked(node)
    }

    /// Records a finished execution, replacing any previous record for its
    /// key, and adds the key to `batch`.
    ///
    /// If a dependency was dirtied after the execution started, the record
    /// is stored dirty unless it is a leaf whose current fingerprint is the
    /// one the execution read.
    pub fn put(&self, batch: &mut WriteBatch, execution: Execution) -> PutOutcome {
        let Execution {
            key,
            value,
            dependencies,
            outputs,
            started_at,
        } = execution;
        let value_hash = ContentHash::of(value.as_bytes());

        let mut state = self.write();
        let revision = state.revision;

        let stale_since = dependencies
            .iter()
            .filter_map(|dep| {
                let at = state.dirtied_at(&dep.node)?;
                (at > started_at && state.differs_from_read(dep)).then_some(at)
            })
            .max();
        let stale_since = stale_since.or_else(|| {
            dependencies
                .iter()
                .filter_map(|dep| dep.node.as_query())
                .filter_map(|child| state.records.get(child))
                .find(|child| child.dirty)
                .map(|child| child.dirtied_at.unwrap_or(revision))
        });
        let stale = stale_since.is_some();

        for dep in &dependencies {
            if !dep.node.is_leaf() {
                continue;
            }
            let input = state
                .inputs
                .entry(dep.node.clone())
                .or_insert_with(|| InputState::observed(dep.node.clone(), dep.fingerprint));
            let observed_after_change = input.dirtied_at.map_or(true, |at| at <= started_at);
            if observed_after_change {
                input.fingerprint = Some(dep.fingerprint);
                input.dirty = false;
            }
            batch.inputs.insert(dep.node.clone());
        }

        let previous = state.records.remove(&key);
        let changed = previous.as_ref().map_or(true, |p| p.value_hash != value_hash);
        let changed_at = match &previous {
            Some(p) if !changed => p.changed_at,
            _ => revision,
        };
        if let Some(previous) = &previous {
            state.unlink(previous);
        }

        let record = QueryRecord {
            key: key.clone(),
            value,
            value_hash,
            dependencies,
            outputs,
            changed_at,
            verified_at: revision,
            dirty: stale,
            dirtied_at: stale_since,
        };
        state.link(&record);
        state.records.insert(key.clone(), record);
        batch.records.insert(key.clone());

        if stale {
            debug!(query = %key, "dependency changed during execution, stored dirty");
        }
        PutOutcome {
            value_hash,
            stale,
            changed,
        }
    }

    /// Persists the current state of every key in `batch` atomically.
    ///
    /// Returns the number of records written. Keys removed since (by
    /// garbage collection) are skipped.
    pub fn commit(&self, batch: WriteBatch) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let state = self.read();
        let changes = ChangeSet {
            revision: Some(state.revision),
            records: batch
                .records
                .iter()
                .filter_map(|key| state.records.get(key).cloned())
                .collect(),
            inputs: batch
                .inputs
                .iter()
                .filter_map(|node| state.inputs.get(node).cloned())
                .collect(),
            ..ChangeSet::default()
        };
        let written = changes.records.len();
        self.persist(&changes)?;
        debug!(records = written, inputs = changes.inputs.len(), "committed batch");
        Ok(written)
    }

    pub fn mark_dirty(&self, node: DepNode) -> Result<InvalidationSet, StorageError> {
        self.mark_dirty_many([node])
    }

    /// Marks `nodes` changed: bumps the revision once, dirties every
    /// transitive dependent, and persists the result.
    pub fn mark_dirty_many(
        &self,
        nodes: impl IntoIterator<Item = DepNode>,
    ) -> Result<InvalidationSet, StorageError> {
        let changes: Vec<(DepNode, Option<ContentHash>)> =
            nodes.into_iter().map(|node| (node, None)).collect();
        let mut state = self.write();
        let (set, persisted) = state.apply_changes(&changes);
        self.persist(&persisted)?;
        info!(
            revision = %set.revision,
            changed = set.changed.len(),
            dirtied = set.dirtied.len(),
            "recorded change"
        );
        Ok(set)
    }

    /// Sets a config input's fingerprint. Returns `None` if the value is
    /// unchanged.
    pub fn set_input(
        &self,
        name: &str,
        fingerprint: ContentHash,
    ) -> Result<Option<InvalidationSet>, StorageError> {
        let node = DepNode::Input(name.to_string());
        let mut state = self.write();
        if let Some(input) = state.inputs.get(&node) {
            if !input.dirty && input.fingerprint == Some(fingerprint) {
                return Ok(None);
            }
        }
        let (set, persisted) = state.apply_changes(&[(node, Some(fingerprint))]);
        self.persist(&persisted)?;
        debug!(input = name, revision = %set.revision, dirtied = set.dirtied.len(), "set input");
        Ok(Some(set))
    }

    /// Records a new fingerprint for a leaf that earlier executions read,
    /// dirtying those readers. Returns `None` if the node was never read or
    /// its fingerprint is unchanged.
    pub fn refresh_leaf(
        &self,
        node: DepNode,
        fingerprint: ContentHash,
    ) -> Result<Option<InvalidationSet>, StorageError> {
        let mut state = self.write();
        match state.inputs.get(&node) {
            Some(input) if input.dirty || input.fingerprint != Some(fingerprint) => {}
            _ => return Ok(None),
        }
        let (set, persisted) = state.apply_changes(&[(node.clone(), Some(fingerprint))]);
        self.persist(&persisted)?;
        debug!(node = %node, revision = %set.revision, dirtied = set.dirtied.len(), "leaf changed");
        Ok(Some(set))
    }

    /// The current fingerprint of a config input, if one was ever set.
    pub fn input(&self, name: &str) -> Option<ContentHash> {
        self.read()
            .inputs
            .get(&DepNode::Input(name.to_string()))
            .and_then(|input| input.fingerprint)
    }

    /// Leaf nodes with a recorded fingerprint and at least one reader.
    pub fn tracked_inputs(&self) -> Vec<InputState> {
        let state = self.read();
        let mut inputs: Vec<InputState> = state
            .inputs
            .values()
            .filter(|input| input.fingerprint.is_some())
            .filter(|input| state.dependents.contains_key(&input.node))
            .cloned()
            .collect();
        inputs.sort_by(|a, b| a.node.cmp(&b.node));
        inputs
    }

    /// Queries whose recorded outputs include `blob`.
    pub fn producers_of(&self, blob: &ContentHash) -> Vec<QueryKey> {
        let state = self.read();
        let mut keys: Vec<QueryKey> = state
            .records
            .values()
            .filter(|record| record.outputs.contains(blob))
            .map(|record| record.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Queries with at least one output blob matching `missing`.
    pub fn producers_where(&self, missing: impl Fn(&ContentHash) -> bool) -> Vec<QueryKey> {
        let state = self.read();
        let mut keys: Vec<QueryKey> = state
            .records
            .values()
            .filter(|record| record.outputs.iter().any(&missing))
            .map(|record| record.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Queries that read `node` directly.
    pub fn dependents_of(&self, node: &DepNode) -> Vec<QueryKey> {
        let state = self.read();
        let mut keys: Vec<QueryKey> = state
            .dependents
            .get(node)
            .map(|readers| readers.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Removes every record not reachable from `roots`, and every leaf
    /// input nothing reads any more. Config inputs are always kept.
    pub fn collect_garbage(&self, roots: &[QueryKey]) -> Result<GcReport, StorageError> {
        let mut state = self.write();

        let mut reachable: HashSet<QueryKey> = HashSet::new();
        let mut stack: Vec<QueryKey> = roots.to_vec();
        while let Some(key) = stack.pop() {
            if !reachable.insert(key.clone()) {
                continue;
            }
            if let Some(record) = state.records.get(&key) {
                stack.extend(record.query_dependencies().cloned());
            }
        }

        let mut removed_records: Vec<QueryKey> = state
            .records
            .keys()
            .filter(|key| !reachable.contains(*key))
            .cloned()
            .collect();
        removed_records.sort();
        for key in &removed_records {
            if let Some(record) = state.records.remove(key) {
                state.unlink(&record);
            }
        }

        let removed_inputs: Vec<DepNode> = state
            .inputs
            .keys()
            .filter(|node| !matches!(node, DepNode::Input(_)))
            .filter(|node| !state.dependents.contains_key(*node))
            .cloned()
            .collect();
        for node in &removed_inputs {
            state.inputs.remove(node);
        }

        let mut live_blobs: HashSet<ContentHash> = state
            .records
            .values()
            .flat_map(|record| record.referenced_blobs())
            .collect();
        live_blobs.extend(
            state
                .inputs
                .values()
                .filter(|input| matches!(input.node, DepNode::Input(_)))
                .filter_map(|input| input.fingerprint),
        );

        self.persist(&ChangeSet {
            removed_records: removed_records.clone(),
            removed_inputs: removed_inputs.clone(),
            ..ChangeSet::default()
        })?;
        info!(
            removed_records = removed_records.len(),
            removed_inputs = removed_inputs.len(),
            live_blobs = live_blobs.len(),
            "collected garbage"
        );
        Ok(GcReport {
            removed_records,
            removed_inputs: removed_inputs.len(),
            live_blobs,
        })
    }

    pub fn stats(&self) -> DbStats {
        let state = self.read();
        DbStats {
            revision: state.revision,
            records: state.records.len(),
            dirty_records: state.records.values().filter(|r| r.dirty).count(),
            inputs: state.inputs.len(),
            edges: state.dependents.values().map(HashSet::len).sum(),
        }
    }

    /// A snapshot of the dependency graph, for inspection and DOT export.
    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::from_records(self.read().records.values())
    }
}
