//! Shared data model for the kiln incremental pipeline.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`hash`]: [`ContentHash`], the blake3 digest used for content addressing
//! - [`id`]: [`QueryKey`] and [`Revision`]
//! - [`node`]: [`DepNode`] and [`Dependency`], the vertices and edges of the
//!   dependency graph
//! - [`path`]: [`CanonicalPath`] and lexical path normalization
//! - [`error`]: [`CoreError`]

pub mod error;
pub mod hash;
pub mod id;
pub mod node;
pub mod path;

// Re-export commonly used types
pub use error::CoreError;
pub use hash::ContentHash;
pub use id::{QueryKey, Revision};
pub use node::{DepNode, Dependency};
pub use path::{normalize_path, CanonicalPath};
