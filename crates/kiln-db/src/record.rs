//! Persisted record types.

use std::collections::HashSet;
use std::sync::Arc;

use kiln_core::{ContentHash, DepNode, Dependency, QueryKey, Revision};

/// The memoized outcome of one query execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub key: QueryKey,
    /// Canonical JSON of the returned value.
    pub value: Arc<str>,
    /// Hash of `value`; the fingerprint dependents record for this query.
    pub value_hash: ContentHash,
    /// Dependencies in the order they were first read.
    pub dependencies: Vec<Dependency>,
    /// Blobs this execution produced.
    pub outputs: Vec<ContentHash>,
    /// Revision at which this value was computed.
    pub changed_at: Revision,
    /// Latest revision at which the value was confirmed current.
    pub verified_at: Revision,
    pub dirty: bool,
    /// Revision of the change that last dirtied this record.
    pub dirtied_at: Option<Revision>,
}

impl QueryRecord {
    /// Query dependencies only.
    pub fn query_dependencies(&self) -> impl Iterator<Item = &QueryKey> {
        self.dependencies.iter().filter_map(|d| d.node.as_query())
    }

    /// Blobs this record keeps alive: its outputs and any blob it read.
    pub fn referenced_blobs(&self) -> impl Iterator<Item = ContentHash> + '_ {
        let read = self.dependencies.iter().filter_map(|d| match &d.node {
            DepNode::Blob(hash) => Some(*hash),
            _ => None,
        });
        self.outputs.iter().copied().chain(read)
    }
}

/// Tracked state of a leaf node (a file, listing, blob, or config input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputState {
    pub node: DepNode,
    /// Fingerprint most recently observed by a query; `None` if the node was
    /// only ever reported as changed.
    pub fingerprint: Option<ContentHash>,
    pub dirty: bool,
    pub dirtied_at: Option<Revision>,
}

impl InputState {
    pub fn observed(node: DepNode, fingerprint: ContentHash) -> Self {
        InputState {
            node,
            fingerprint: Some(fingerprint),
            dirty: false,
            dirtied_at: None,
        }
    }
}

/// Everything a backend holds, as loaded on open.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// `None` for a fresh database.
    pub revision: Option<Revision>,
    pub records: Vec<QueryRecord>,
    pub inputs: Vec<InputState>,
}

/// One atomic unit of persisted change.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub revision: Option<Revision>,
    /// Records written in full, replacing any stored version.
    pub records: Vec<QueryRecord>,
    pub removed_records: Vec<QueryKey>,
    pub inputs: Vec<InputState>,
    pub removed_inputs: Vec<DepNode>,
    /// Records dirtied at the given revision. Only rows already stored are
    /// updated, and only their dirty flag columns.
    pub dirtied: Vec<(QueryKey, Revision)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.revision.is_none()
            && self.records.is_empty()
            && self.removed_records.is_empty()
            && self.inputs.is_empty()
            && self.removed_inputs.is_empty()
            && self.dirtied.is_empty()
    }
}

/// Keys touched by one top-level request, persisted together on commit.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) records: HashSet<QueryKey>,
    pub(crate) inputs: HashSet<DepNode>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.inputs.is_empty()
    }

    /// Moves every key of `other` into this batch.
    pub fn absorb(&mut self, other: WriteBatch) {
        self.records.extend(other.records);
        self.inputs.extend(other.inputs);
    }
}
