//! Dirty propagation over the reverse dependency index.
//!
//! A change to any node dirties every query that transitively depends on
//! it. The closure is computed eagerly by a breadth-first walk from the
//! changed nodes through their dependents, so later validity checks only
//! have to look at a record's own flag.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use kiln_core::{DepNode, QueryKey, Revision};

/// Reverse edges: node -> queries that read it.
pub type DependentsIndex = HashMap<DepNode, HashSet<QueryKey>>;

/// The result of one dirtying step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSet {
    /// Revision the change was recorded at.
    pub revision: Revision,
    /// The nodes reported as changed.
    pub changed: Vec<DepNode>,
    /// Every query marked dirty, including changed query nodes themselves.
    pub dirtied: BTreeSet<QueryKey>,
}

impl InvalidationSet {
    pub fn is_empty(&self) -> bool {
        self.dirtied.is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.dirtied.contains(key)
    }
}

/// Queries reachable from `seeds` through `dependents`.
///
/// Query-valued seeds are included in the result; leaf seeds are not.
pub fn dirty_closure<'a>(
    seeds: impl IntoIterator<Item = &'a DepNode>,
    dependents: &DependentsIndex,
) -> BTreeSet<QueryKey> {
    let mut dirtied: BTreeSet<QueryKey> = BTreeSet::new();
    let mut queue: VecDeque<DepNode> = VecDeque::new();

    for seed in seeds {
        if let DepNode::Query(key) = seed {
            dirtied.insert(key.clone());
        }
        queue.push_back(seed.clone());
    }

    while let Some(node) = queue.pop_front() {
        let Some(readers) = dependents.get(&node) else {
            continue;
        };
        for reader in readers {
            if dirtied.insert(reader.clone()) {
                queue.push_back(DepNode::Query(reader.clone()));
            }
        }
    }
    dirtied
}
