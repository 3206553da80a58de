//! Query error types.
//!
//! [`QueryError`] is `Clone`: when several callers wait on one in-flight
//! computation, each receives the same failure. Causes that are not
//! themselves cloneable are shared behind `Arc`.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use kiln_core::{CoreError, QueryKey};
use kiln_db::StorageError;
use kiln_store::{PathErrorKind, StoreError};

/// Errors surfaced by queries and requests.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// A path could not be resolved or escapes the root.
    #[error("cannot resolve {}: {kind}", path.display())]
    Path { path: PathBuf, kind: PathErrorKind },

    /// A blob, placeholder or config input does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A compute function failed. `key` is the innermost failing query.
    #[error("query {} failed: {cause}", display_key(key))]
    Compute {
        key: Option<QueryKey>,
        cause: Arc<dyn StdError + Send + Sync>,
    },

    /// Stored content is corrupt or unreadable.
    #[error(transparent)]
    Content(Arc<StoreError>),

    /// The dependency database failed. Fatal for the engine.
    #[error("storage failure: {0}")]
    Storage(Arc<StorageError>),

    /// A query (transitively) requested itself.
    #[error("dependency cycle at {key}: {}", display_path(path))]
    Cycle { key: QueryKey, path: Vec<QueryKey> },

    #[error("request cancelled")]
    Cancelled,

    /// A value could not be encoded or decoded as JSON.
    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// A query key could not be built.
    #[error(transparent)]
    Key(#[from] CoreError),
}

fn display_key(key: &Option<QueryKey>) -> String {
    key.as_ref()
        .map_or_else(|| "<unknown>".to_string(), |k| k.to_string())
}

fn display_path(path: &[QueryKey]) -> String {
    path.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A plain message used as a compute failure cause.
#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl QueryError {
    /// Wraps a failure of user compute code.
    pub fn compute(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        QueryError::Compute {
            key: None,
            cause: Arc::from(cause.into()),
        }
    }

    /// A compute failure with a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        QueryError::Compute {
            key: None,
            cause: Arc::new(Message(message.into())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, QueryError::Storage(_))
    }

    /// Attributes an anonymous compute failure to `key`.
    pub(crate) fn attributed_to(self, key: &QueryKey) -> Self {
        match self {
            QueryError::Compute { key: None, cause } => QueryError::Compute {
                key: Some(key.clone()),
                cause,
            },
            other => other,
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Path { path, kind } => QueryError::Path { path, kind },
            StoreError::BlobNotFound(hash) => QueryError::NotFound {
                what: format!("blob {hash}"),
            },
            StoreError::PlaceholderNotFound(name) => QueryError::NotFound {
                what: format!("placeholder '{name}'"),
            },
            other => QueryError::Content(Arc::new(other)),
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        QueryError::Storage(Arc::new(err))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(Arc::new(err))
    }
}
