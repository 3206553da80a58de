//! Invalidation controller: turns change notifications into dirty records.
//!
//! Each tracked leaf moves `Clean -> Dirty` when a change is reported and
//! back to `Clean` only when a fresh execution observes it again. Changes
//! arrive either as explicit [`ChangeEvent`]s or from [`Engine::reconcile`],
//! which compares every tracked leaf with what is on disk now.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use kiln_core::{CanonicalPath, ContentHash, DepNode, QueryKey, Revision};
use kiln_db::InvalidationSet;
use kiln_store::StoreError;

use crate::context::missing_fingerprint;
use crate::engine::Engine;
use crate::error::QueryError;

/// A change observed outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Modified(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
    /// A blob was regenerated or went missing from the blob directory.
    AssetRegenerated(ContentHash),
    /// A configuration value changed outside [`Engine::set_input`].
    InputChanged(String),
    /// Changes may have been missed; compare everything with the disk.
    Rescan,
}

/// The union of everything a batch of events dirtied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Revision after the last event was applied.
    pub revision: Revision,
    pub changed: Vec<DepNode>,
    pub dirtied: BTreeSet<QueryKey>,
}

impl InvalidationReport {
    fn at(revision: Revision) -> Self {
        InvalidationReport {
            revision,
            changed: Vec::new(),
            dirtied: BTreeSet::new(),
        }
    }

    fn absorb(&mut self, set: InvalidationSet) {
        self.revision = set.revision;
        self.changed.extend(set.changed);
        self.dirtied.extend(set.dirtied);
    }

    /// True if no query was dirtied.
    pub fn is_empty(&self) -> bool {
        self.dirtied.is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.dirtied.contains(key)
    }
}

impl Engine {
    /// Applies `events` in order. Each event that touches a tracked node
    /// bumps the revision once; events that touch nothing tracked are
    /// dropped without a bump.
    pub fn apply_changes(
        &self,
        events: impl IntoIterator<Item = ChangeEvent>,
    ) -> Result<InvalidationReport, QueryError> {
        self.check_poisoned()?;
        let mut report = InvalidationReport::at(self.db().revision());
        for event in events {
            let nodes = self.relevant(self.nodes_for(&event));
            if nodes.is_empty() {
                debug!(?event, "change touches nothing tracked");
                continue;
            }
            let set = self
                .db()
                .mark_dirty_many(nodes)
                .map_err(|err| self.poison(err))?;
            report.absorb(set);
        }
        Ok(report)
    }

    pub fn apply_change(&self, event: ChangeEvent) -> Result<InvalidationReport, QueryError> {
        self.apply_changes([event])
    }

    /// Dirties every tracked leaf whose stored fingerprint no longer
    /// matches the filesystem or the blob directory, and every query whose
    /// output blobs are missing. Does not bump the revision if nothing
    /// changed.
    pub fn reconcile(&self) -> Result<InvalidationReport, QueryError> {
        self.check_poisoned()?;
        let mut report = InvalidationReport::at(self.db().revision());
        let stale = self.stale_nodes();
        if stale.is_empty() {
            debug!("reconcile found no changes");
            return Ok(report);
        }
        let set = self
            .db()
            .mark_dirty_many(stale)
            .map_err(|err| self.poison(err))?;
        info!(
            changed = set.changed.len(),
            dirtied = set.dirtied.len(),
            "reconciled with filesystem"
        );
        report.absorb(set);
        Ok(report)
    }

    fn nodes_for(&self, event: &ChangeEvent) -> Vec<DepNode> {
        match event {
            ChangeEvent::Modified(path) => match self.event_path(path) {
                Some(path) => {
                    self.store().invalidate(&path);
                    vec![DepNode::File(path)]
                }
                None => Vec::new(),
            },
            ChangeEvent::Created(path) | ChangeEvent::Removed(path) => {
                let Some(path) = self.event_path(path) else {
                    return Vec::new();
                };
                self.store().invalidate(&path);
                let mut nodes = Vec::with_capacity(2);
                if let Some(parent) = path.parent() {
                    nodes.push(DepNode::Listing(parent));
                }
                nodes.insert(0, DepNode::File(path));
                nodes
            }
            ChangeEvent::AssetRegenerated(hash) => {
                let mut nodes = vec![DepNode::Blob(*hash)];
                nodes.extend(self.db().producers_of(hash).into_iter().map(DepNode::Query));
                nodes
            }
            ChangeEvent::InputChanged(name) => vec![DepNode::Input(name.clone())],
            ChangeEvent::Rescan => {
                self.store().invalidate_all();
                self.stale_nodes()
            }
        }
    }

    /// Drops nodes nothing has read. While any execution is running every
    /// node is kept, since it may be reading one of them right now.
    fn relevant(&self, nodes: Vec<DepNode>) -> Vec<DepNode> {
        if self.inflight().running() > 0 {
            return nodes;
        }
        nodes
            .into_iter()
            .filter(|node| self.db().is_tracked(node))
            .collect()
    }

    /// The identity a changed path is tracked under. Removed files no
    /// longer resolve, so their parent directory is resolved instead.
    /// Paths in the cache directory are never tracked.
    fn event_path(&self, path: &Path) -> Option<CanonicalPath> {
        let store = self.store();
        let lexical = store.lexical(path);
        if lexical.starts_with(self.cache_dir()) {
            trace!(path = %lexical, "ignoring change in the cache directory");
            return None;
        }
        if let Ok(resolved) = store.resolve(path) {
            if resolved.starts_with(self.cache_dir()) {
                return None;
            }
            return Some(resolved);
        }
        if !lexical.starts_with(store.root()) {
            debug!(path = %lexical, "ignoring change outside the root");
            return None;
        }
        let resolved_parent = lexical
            .parent()
            .and_then(|parent| store.resolve(parent.as_path()).ok());
        match (resolved_parent, lexical.file_name()) {
            (Some(parent), Some(name)) => {
                Some(CanonicalPath::from_canonical(parent.as_path().join(name)))
            }
            _ => Some(lexical),
        }
    }

    fn stale_nodes(&self) -> Vec<DepNode> {
        let store = self.store();
        let mut stale = Vec::new();
        for input in self.db().tracked_inputs() {
            if input.dirty {
                continue;
            }
            let Some(stored) = input.fingerprint else {
                continue;
            };
            let changed = match &input.node {
                DepNode::File(path) => match store.rehash(path) {
                    Ok(current) => current.unwrap_or_else(missing_fingerprint) != stored,
                    Err(err) => {
                        warn!(path = %path, error = %err, "cannot rehash tracked file");
                        true
                    }
                },
                DepNode::Listing(dir) => match store.listing_fingerprint(dir) {
                    Ok(current) => current != Some(stored),
                    Err(err) => {
                        warn!(dir = %dir, error = %err, "cannot list tracked directory");
                        true
                    }
                },
                DepNode::Blob(hash) => !store.contains(hash),
                DepNode::Name(logical) => match store.placeholder(logical) {
                    Ok(current) => current != stored,
                    Err(StoreError::PlaceholderNotFound(_)) => true,
                    Err(err) => {
                        warn!(name = %logical, error = %err, "cannot read placeholder binding");
                        true
                    }
                },
                // Config values only change through set_input or events.
                DepNode::Input(_) | DepNode::Query(_) => false,
            };
            if changed {
                debug!(node = %input.node, "tracked input changed");
                stale.push(input.node);
            }
        }
        stale.extend(
            self.db()
                .producers_where(|hash| !store.contains(hash))
                .into_iter()
                .map(DepNode::Query),
        );
        stale
    }
}
