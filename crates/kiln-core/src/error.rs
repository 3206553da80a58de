//! Core error types for kiln-core.
//!
//! These cover decoding failures for the persisted encodings of hashes,
//! query keys and dependency nodes.

use thiserror::Error;

/// Core errors produced by the kiln-core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A string was not a 64-character hex blake3 digest.
    #[error("invalid content hash: '{raw}'")]
    InvalidHash { raw: String },

    /// A persisted dependency node encoding could not be decoded.
    #[error("invalid dependency node encoding: '{raw}'")]
    InvalidNode { raw: String },

    /// A query name was empty or contained a reserved character.
    #[error("invalid query name: '{name}'")]
    InvalidQueryName { name: String },

    /// Query arguments could not be encoded or decoded.
    #[error("invalid arguments for query '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
}
