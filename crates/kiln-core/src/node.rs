//! Vertices and edges of the dependency graph.
//!
//! A [`DepNode`] is anything a query record can depend on. The persisted
//! form of a node is a prefixed string (see [`DepNode::encode`]) that is used
//! as the primary key of database rows, so the encoding must stay stable
//! across releases.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::ContentHash;
use crate::id::QueryKey;
use crate::path::CanonicalPath;

const QUERY_PREFIX: &str = "query:";
const FILE_PREFIX: &str = "file:";
const BLOB_PREFIX: &str = "blob:";
const LISTING_PREFIX: &str = "dir:";
const INPUT_PREFIX: &str = "input:";
const NAME_PREFIX: &str = "name:";

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepNode {
    /// The result of another query.
    Query(QueryKey),
    /// The bytes of a source file.
    File(CanonicalPath),
    /// A stored content-addressed blob.
    Blob(ContentHash),
    /// The member set of a directory (synthetic node for derived collections).
    Listing(CanonicalPath),
    /// A named configuration parameter.
    Input(String),
    /// The binding of a logical placeholder name to a blob.
    Name(String),
}

impl DepNode {
    /// Returns true for every node that is not a query. Leaves have no
    /// dependencies of their own.
    pub fn is_leaf(&self) -> bool {
        !matches!(self, DepNode::Query(_))
    }

    pub fn as_query(&self) -> Option<&QueryKey> {
        match self {
            DepNode::Query(key) => Some(key),
            _ => None,
        }
    }

    /// Stable textual encoding used as a database identifier.
    pub fn encode(&self) -> String {
        match self {
            DepNode::Query(key) => format!("{QUERY_PREFIX}{}{}", key.name(), key.args_json()),
            DepNode::File(path) => format!("{FILE_PREFIX}{}", path.display()),
            DepNode::Blob(hash) => format!("{BLOB_PREFIX}{}", hash.to_hex()),
            DepNode::Listing(path) => format!("{LISTING_PREFIX}{}", path.display()),
            DepNode::Input(name) => format!("{INPUT_PREFIX}{name}"),
            DepNode::Name(logical) => format!("{NAME_PREFIX}{logical}"),
        }
    }

    /// Inverse of [`DepNode::encode`].
    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidNode {
            raw: raw.to_string(),
        };
        if let Some(rest) = raw.strip_prefix(QUERY_PREFIX) {
            let split = rest.find('[').ok_or_else(invalid)?;
            let (name, args) = rest.split_at(split);
            return QueryKey::from_parts(name, args)
                .map(DepNode::Query)
                .map_err(|_| invalid());
        }
        if let Some(rest) = raw.strip_prefix(FILE_PREFIX) {
            return Ok(DepNode::File(CanonicalPath::from_canonical(rest)));
        }
        if let Some(rest) = raw.strip_prefix(BLOB_PREFIX) {
            return ContentHash::from_hex(rest)
                .map(DepNode::Blob)
                .map_err(|_| invalid());
        }
        if let Some(rest) = raw.strip_prefix(LISTING_PREFIX) {
            return Ok(DepNode::Listing(CanonicalPath::from_canonical(rest)));
        }
        if let Some(rest) = raw.strip_prefix(INPUT_PREFIX) {
            return Ok(DepNode::Input(rest.to_string()));
        }
        if let Some(rest) = raw.strip_prefix(NAME_PREFIX) {
            return Ok(DepNode::Name(rest.to_string()));
        }
        Err(invalid())
    }
}

impl From<QueryKey> for DepNode {
    fn from(key: QueryKey) -> Self {
        DepNode::Query(key)
    }
}

impl fmt::Display for DepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepNode::Query(key) => write!(f, "{key}"),
            DepNode::File(path) => write!(f, "file {path}"),
            DepNode::Blob(hash) => write!(f, "blob {}", &hash.to_hex()[..12]),
            DepNode::Listing(path) => write!(f, "listing {path}"),
            DepNode::Input(name) => write!(f, "input {name}"),
            DepNode::Name(logical) => write!(f, "name {logical}"),
        }
    }
}

/// One edge of a record's dependency set: the node consulted and the
/// fingerprint observed when it was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub node: DepNode,
    pub fingerprint: ContentHash,
}

impl Dependency {
    pub fn new(node: DepNode, fingerprint: ContentHash) -> Self {
        Dependency { node, fingerprint }
    }
}
