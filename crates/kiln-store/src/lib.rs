//! Content-addressed asset store.
//!
//! [`ContentStore`] reads source files once per process, hashes everything it
//! sees with blake3, and persists generated bytes under hash-named paths so
//! identical content is physically stored once.
//!
//! # Modules
//!
//! - [`asset`]: [`Asset`] and [`AssetKind`]
//! - [`blob`]: on-disk blob directory layout, atomic writes, garbage collection
//! - [`store`]: [`ContentStore`], path resolution and the read cache
//! - [`error`]: [`StoreError`]

pub mod asset;
pub mod blob;
pub mod error;
pub mod store;

pub use asset::{Asset, AssetKind, AssetOrigin, Listing};
pub use blob::BlobDir;
pub use error::{PathErrorKind, StoreError};
pub use store::ContentStore;
