//! Async facade over [`Engine`].
//!
//! Requests are synchronous and may block on other callers, so they run on
//! tokio's blocking pool. Dropping a request future cancels the request:
//! nested work stops at the next `query` or `fork` boundary.

use std::sync::Arc;

use kiln_core::ContentHash;
use kiln_store::Asset;

use crate::cancel::{CancelOnDrop, CancelToken};
use crate::context::QueryContext;
use crate::engine::Engine;
use crate::error::QueryError;
use crate::invalidate::{ChangeEvent, InvalidationReport};

#[derive(Clone)]
pub struct AsyncEngine {
    engine: Arc<Engine>,
}

impl AsyncEngine {
    pub fn new(engine: Engine) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<Engine>) -> Self {
        AsyncEngine { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine, &CancelToken) -> Result<T, QueryError> + Send + 'static,
    {
        let token = CancelToken::new();
        let guard = CancelOnDrop::new(token.clone());
        let engine = Arc::clone(&self.engine);
        let joined = tokio::task::spawn_blocking(move || work(&engine, &token)).await;
        guard.disarm();
        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(QueryError::Cancelled),
        }
    }

    /// Runs `body` as a top-level request on the blocking pool.
    pub async fn request<T, F>(&self, body: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&QueryContext<'_>) -> Result<T, QueryError> + Send + 'static,
    {
        self.blocking(move |engine, token| engine.request_with_cancel(token, body))
            .await
    }

    pub async fn apply_changes(
        &self,
        events: Vec<ChangeEvent>,
    ) -> Result<InvalidationReport, QueryError> {
        self.blocking(move |engine, _| engine.apply_changes(events))
            .await
    }

    pub async fn fetch(&self, hash: ContentHash) -> Result<Asset, QueryError> {
        self.blocking(move |engine, _| engine.fetch(&hash)).await
    }
}
