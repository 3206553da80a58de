//! Query engine and invalidation controller for the kiln pipeline.
//!
//! A build is a tree of memoized queries. Each query reads its inputs
//! through a [`QueryContext`], which records every file, directory listing,
//! blob, config input and nested query it touches. On the next request a
//! query is reused unless something it read has been reported changed, in
//! which case only the dirtied branch runs again.
//!
//! ```no_run
//! use kiln_engine::{ChangeEvent, Engine, EngineConfig, QueryKey};
//!
//! # fn main() -> Result<(), kiln_engine::QueryError> {
//! let engine = Engine::open(EngineConfig::new("site"))?;
//! let key = QueryKey::new("words", ["posts/a.md"])?;
//! let words: usize = engine.query(key, |ctx| {
//!     Ok(ctx.read_to_string("posts/a.md")?.split_whitespace().count())
//! })?;
//! println!("{words}");
//!
//! engine.apply_change(ChangeEvent::Modified("posts/a.md".into()))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: [`Engine`], requests, the worker pool, garbage collection
//! - [`context`]: [`QueryContext`] and dependency recording
//! - [`invalidate`]: [`ChangeEvent`], [`Engine::apply_changes`], [`Engine::reconcile`]
//! - [`async_engine`]: [`AsyncEngine`], the tokio facade
//! - [`config`]: [`EngineConfig`]
//! - `watch` (feature `watch-notify`): `FileWatcher`

pub mod async_engine;
pub mod cancel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
mod inflight;
pub mod invalidate;
#[cfg(any(test, feature = "watch-notify"))]
pub mod watch;

pub use async_engine::AsyncEngine;
pub use cancel::CancelToken;
pub use config::{ConfigError, EngineConfig};
pub use context::QueryContext;
pub use engine::{Engine, EngineStats, GcSummary};
pub use error::QueryError;
pub use invalidate::{ChangeEvent, InvalidationReport};
#[cfg(feature = "watch-notify")]
pub use watch::FileWatcher;

pub use kiln_core::{CanonicalPath, ContentHash, DepNode, QueryKey, Revision};
pub use kiln_store::{Asset, AssetKind, Listing};
