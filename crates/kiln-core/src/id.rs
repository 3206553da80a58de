//! Identity of computations and of database generations.
//!
//! [`QueryKey`] identifies a memoizable computation by name and argument
//! tuple; [`Revision`] numbers the generations of the dependency database.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Global generation counter of the dependency database.
///
/// Incremented whenever an external change is observed. A fresh database
/// starts at [`Revision::INITIAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// The revision of a freshly created database.
    pub const INITIAL: Revision = Revision(1);

    /// The revision following this one.
    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A (name, ordered argument tuple) pair identifying one computation.
///
/// Arguments are encoded once, at construction, as a canonical JSON array.
/// Equality and hashing are structural over the name and that encoding, so
/// two keys built from equal arguments are the same computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    name: String,
    args: String,
}

impl QueryKey {
    /// Builds a key from a name and any serializable argument value.
    ///
    /// Tuples and sequences become the argument list directly; any other
    /// value is treated as a single argument.
    pub fn new<A: Serialize>(name: impl Into<String>, args: A) -> Result<Self, CoreError> {
        let name = name.into();
        validate_name(&name)?;
        let value = serde_json::to_value(args).map_err(|e| CoreError::InvalidArguments {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        let list = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        };
        let args = serde_json::Value::Array(list).to_string();
        Ok(QueryKey { name, args })
    }

    /// A key with an empty argument tuple.
    pub fn unit(name: impl Into<String>) -> Result<Self, CoreError> {
        QueryKey::new(name, ())
    }

    /// Rebuilds a key from its persisted parts, re-canonicalizing the
    /// arguments.
    pub fn from_parts(name: &str, args_json: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value =
            serde_json::from_str(args_json).map_err(|e| CoreError::InvalidArguments {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if !value.is_array() {
            return Err(CoreError::InvalidArguments {
                name: name.to_string(),
                reason: "arguments must be a JSON array".into(),
            });
        }
        QueryKey::new(name, value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical JSON array of arguments.
    pub fn args_json(&self) -> &str {
        &self.args
    }

    /// Decodes the argument tuple into `T`.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_str(&self.args).map_err(|e| CoreError::InvalidArguments {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Names must be non-empty and free of `[`, which starts the argument list
/// in the persisted encoding.
fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.contains('[') {
        return Err(CoreError::InvalidQueryName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.args[1..self.args.len() - 1];
        write!(f, "{}({})", self.name, inner)
    }
}
