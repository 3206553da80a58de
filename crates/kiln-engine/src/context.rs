//! The per-query context handed to compute functions.
//!
//! Every read a compute function makes through its [`QueryContext`] is
//! recorded as a dependency of the query being computed: nested queries,
//! source files, directory listings, blobs and config inputs. The recorded
//! set is exactly what the next validity check consults, so a compute
//! function must reach the outside world only through its context.

use std::cell::RefCell;
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use kiln_core::{ContentHash, DepNode, Dependency, QueryKey};
use kiln_db::{Execution, WriteBatch};
use kiln_store::{Asset, Listing};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::QueryError;
use crate::inflight::Claim;

/// Fingerprint recorded for a file that did not exist when read.
pub(crate) fn missing_fingerprint() -> ContentHash {
    ContentHash::of_parts([b"kiln".as_slice(), b"missing".as_slice()])
}

/// State shared by every context of one top-level request.
pub(crate) struct RequestScope {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancelToken,
    pub(crate) batch: std::sync::Mutex<WriteBatch>,
}

impl RequestScope {
    pub(crate) fn new(cancel: CancelToken) -> Self {
        RequestScope {
            id: Uuid::new_v4(),
            cancel,
            batch: std::sync::Mutex::new(WriteBatch::new()),
        }
    }

    pub(crate) fn take_batch(&self) -> WriteBatch {
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *batch)
    }
}

/// Dependencies and outputs of one execution, in first-read order.
#[derive(Debug, Default)]
struct Recorder {
    deps: RefCell<IndexMap<DepNode, ContentHash>>,
    outputs: RefCell<IndexSet<ContentHash>>,
}

impl Recorder {
    fn absorb(&self, other: Recorder) {
        let mut deps = self.deps.borrow_mut();
        for (node, fingerprint) in other.deps.into_inner() {
            deps.entry(node).or_insert(fingerprint);
        }
        self.outputs.borrow_mut().extend(other.outputs.into_inner());
    }

    fn into_parts(self) -> (Vec<Dependency>, Vec<ContentHash>) {
        let deps = self
            .deps
            .into_inner()
            .into_iter()
            .map(|(node, fingerprint)| Dependency::new(node, fingerprint))
            .collect();
        (deps, self.outputs.into_inner().into_iter().collect())
    }
}

/// Handle through which compute functions read inputs and call queries.
///
/// A context belongs to one thread; use [`QueryContext::fork`] for
/// parallel sub-work.
pub struct QueryContext<'e> {
    engine: &'e Engine,
    scope: &'e RequestScope,
    /// Enclosing query keys, innermost last. Empty at the top level.
    stack: Vec<QueryKey>,
    /// `None` at the top level, where reads are not memoized.
    recorder: Option<Recorder>,
}

impl<'e> QueryContext<'e> {
    pub(crate) fn top(engine: &'e Engine, scope: &'e RequestScope) -> Self {
        QueryContext {
            engine,
            scope,
            stack: Vec::new(),
            recorder: None,
        }
    }

    fn child(&self, key: QueryKey) -> QueryContext<'e> {
        let mut stack = self.stack.clone();
        stack.push(key);
        QueryContext {
            engine: self.engine,
            scope: self.scope,
            stack,
            recorder: Some(Recorder::default()),
        }
    }

    /// A sibling context for a forked thunk: same enclosing query, own
    /// recorder.
    fn sibling(&self) -> QueryContext<'e> {
        QueryContext {
            engine: self.engine,
            scope: self.scope,
            stack: self.stack.clone(),
            recorder: self.recorder.as_ref().map(|_| Recorder::default()),
        }
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// The query being computed, or `None` at the top level of a request.
    pub fn key(&self) -> Option<&QueryKey> {
        self.stack.last()
    }

    pub fn request_id(&self) -> Uuid {
        self.scope.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.cancel.is_cancelled()
    }

    fn record(&self, node: DepNode, fingerprint: ContentHash) {
        if let Some(recorder) = &self.recorder {
            recorder.deps.borrow_mut().entry(node).or_insert(fingerprint);
        }
    }

    fn check_cancelled(&self) -> Result<(), QueryError> {
        // Work others are blocked on runs to completion for them.
        if self.is_cancelled() && !self.engine.inflight().has_waiters(&self.stack) {
            return Err(QueryError::Cancelled);
        }
        Ok(())
    }

    /// Returns the value of `key`, computing it with `compute` only if no
    /// valid memoized value exists.
    ///
    /// The value is stored as canonical JSON; a cached hit is decoded back
    /// into `T`. Concurrent callers for the same key share one execution.
    pub fn query<T, F>(&self, key: QueryKey, compute: F) -> Result<T, QueryError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&QueryContext<'e>) -> Result<T, QueryError>,
    {
        self.engine.check_poisoned()?;
        self.check_cancelled()?;
        let engine = self.engine;

        loop {
            if let Some(value) = self.cached(&key)? {
                return Ok(value);
            }

            let claim = engine.inflight().claim(
                &key,
                self.key(),
                &self.scope.cancel,
                engine.config().wait_poll(),
            )?;
            match claim {
                Claim::Shared(Ok(())) => {
                    engine.counters().record_wait();
                    // The owner's record is now in the database; a stale
                    // one fails the validity check and is recomputed.
                    continue;
                }
                Claim::Shared(Err(err)) => {
                    engine.counters().record_wait();
                    return Err(err);
                }
                Claim::Owner(guard) => {
                    // Someone may have finished between our check and claim.
                    if let Some(value) = self.cached(&key)? {
                        guard.complete(Ok(()));
                        return Ok(value);
                    }
                    let result = self.execute(&key, compute);
                    guard.complete(result.as_ref().map(|_| ()).map_err(Clone::clone));
                    return result;
                }
            }
        }
    }

    fn cached<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, QueryError> {
        let Some(record) = self.engine.db().valid_record(key) else {
            return Ok(None);
        };
        let value = serde_json::from_str(&record.value)?;
        self.engine.counters().record_hit();
        trace!(query = %key, "cache hit");
        self.record(DepNode::Query(key.clone()), record.value_hash);
        Ok(Some(value))
    }

    fn execute<T, F>(&self, key: &QueryKey, compute: F) -> Result<T, QueryError>
    where
        T: Serialize,
        F: FnOnce(&QueryContext<'e>) -> Result<T, QueryError>,
    {
        let engine = self.engine;
        let started_at = engine.db().revision();
        let child = self.child(key.clone());
        engine.counters().record_execution();
        debug!(query = %key, revision = %started_at, "executing");

        let value = compute(&child).map_err(|e| e.attributed_to(key))?;
        let json = serde_json::to_string(&serde_json::to_value(&value)?)?;

        let (dependencies, outputs) = child
            .recorder
            .map(Recorder::into_parts)
            .unwrap_or_default();
        let deps_count = dependencies.len();
        let outcome = {
            let mut batch = self.scope.batch.lock().unwrap_or_else(|e| e.into_inner());
            engine.db().put(
                &mut batch,
                Execution {
                    key: key.clone(),
                    value: json.into(),
                    dependencies,
                    outputs,
                    started_at,
                },
            )
        };
        debug!(
            query = %key,
            deps = deps_count,
            changed = outcome.changed,
            stale = outcome.stale,
            "executed"
        );
        self.record(DepNode::Query(key.clone()), outcome.value_hash);
        Ok(value)
    }

    /// Runs `thunks` in parallel, one scoped thread each, and returns their
    /// results in order. Dependencies recorded by the thunks are merged into
    /// this context in thunk order.
    pub fn fork<T, F>(&self, thunks: Vec<F>) -> Vec<Result<T, QueryError>>
    where
        T: Send,
        F: FnOnce(&QueryContext<'e>) -> Result<T, QueryError> + Send,
    {
        if let Err(err) = self.check_cancelled() {
            return thunks.into_iter().map(|_| Err(err.clone())).collect();
        }

        let joined = std::thread::scope(|s| {
            let handles: Vec<_> = thunks
                .into_iter()
                .map(|thunk| {
                    let sibling = self.sibling();
                    s.spawn(move || {
                        let result = thunk(&sibling);
                        (result, sibling.recorder)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        });

        let mut results = Vec::with_capacity(joined.len());
        for outcome in joined {
            match outcome {
                Ok((result, recorder)) => {
                    if let (Some(mine), Some(theirs)) = (&self.recorder, recorder) {
                        mine.absorb(theirs);
                    }
                    results.push(result);
                }
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        results
    }

    /// Resolves a path to its canonical identity without reading it.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<kiln_core::CanonicalPath, QueryError> {
        Ok(self.engine.store().resolve(path)?)
    }

    /// Reads a source file and records it as a dependency.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Asset, QueryError> {
        let path = self.engine.store().resolve(path)?;
        let asset = self.engine.store().read(&path)?;
        self.record(DepNode::File(path), asset.hash);
        Ok(asset)
    }

    /// Like [`read`](Self::read), but a missing file is `None` and still
    /// recorded, so creating it later invalidates this query.
    pub fn read_optional(&self, path: impl AsRef<Path>) -> Result<Option<Asset>, QueryError> {
        let store = self.engine.store();
        match store.resolve(path.as_ref()) {
            Ok(resolved) => match store.read(&resolved) {
                Ok(asset) => {
                    self.record(DepNode::File(resolved), asset.hash);
                    Ok(Some(asset))
                }
                Err(err) => Err(err.into()),
            },
            Err(kiln_store::StoreError::Path {
                kind: kiln_store::PathErrorKind::Missing,
                ..
            }) => {
                self.record(DepNode::File(store.lexical(path)), missing_fingerprint());
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String, QueryError> {
        let asset = self.read(path)?;
        String::from_utf8(asset.bytes().to_vec()).map_err(QueryError::compute)
    }

    /// Lists a directory and records its member set as a dependency.
    pub fn list_dir(&self, path: impl AsRef<Path>) -> Result<Listing, QueryError> {
        let dir = self.engine.store().resolve(path)?;
        let listing = self.engine.store().list_dir(&dir)?;
        self.record(DepNode::Listing(dir), listing.fingerprint);
        Ok(listing)
    }

    /// Fetches stored content and records the blob as a dependency.
    pub fn fetch(&self, hash: &ContentHash) -> Result<Asset, QueryError> {
        let asset = self.engine.store().fetch(hash)?;
        self.record(DepNode::Blob(*hash), *hash);
        Ok(asset)
    }

    /// Resolves a logical placeholder to the hash of its generated content.
    ///
    /// Both the binding and the blob are recorded: rebinding the name or
    /// losing the blob invalidates this query.
    pub fn placeholder(&self, logical: &str) -> Result<ContentHash, QueryError> {
        let hash = self.engine.store().placeholder(logical)?;
        self.record(DepNode::Name(logical.to_string()), hash);
        self.record(DepNode::Blob(hash), hash);
        Ok(hash)
    }

    /// Persists generated bytes as an output of the current query.
    pub fn store(&self, bytes: &[u8]) -> Result<ContentHash, QueryError> {
        let hash = self.engine.store().store(bytes)?;
        self.record_output(hash);
        Ok(hash)
    }

    /// Persists generated bytes under a logical placeholder name. Queries
    /// that resolved an earlier binding of the name are dirtied.
    pub fn store_named(&self, logical: &str, bytes: &[u8]) -> Result<ContentHash, QueryError> {
        let hash = self.engine.store().store_named(logical, bytes)?;
        self.record_output(hash);
        let rebound = self
            .engine
            .db()
            .refresh_leaf(DepNode::Name(logical.to_string()), hash)
            .map_err(|err| self.engine.poison(err))?;
        if let Some(set) = rebound {
            debug!(name = logical, dirtied = set.dirtied.len(), "placeholder rebound");
        }
        Ok(hash)
    }

    fn record_output(&self, hash: ContentHash) {
        if let Some(recorder) = &self.recorder {
            recorder.outputs.borrow_mut().insert(hash);
        }
    }

    /// Reads a config input set with [`Engine::set_input`].
    pub fn input<T: DeserializeOwned>(&self, name: &str) -> Result<T, QueryError> {
        let Some(hash) = self.engine.db().input(name) else {
            return Err(QueryError::NotFound {
                what: format!("input '{name}'"),
            });
        };
        let asset = self.engine.store().fetch(&hash)?;
        let value = serde_json::from_slice(asset.bytes())?;
        self.record(DepNode::Input(name.to_string()), hash);
        Ok(value)
    }
}
