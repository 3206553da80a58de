//! The query engine: top-level requests over the content store and the
//! dependency database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;
use tracing::{debug, error, info, info_span};

use kiln_core::{ContentHash, QueryKey};
use kiln_db::{Database, DbStats, DependencyGraph, InMemoryRecordStore, InvalidationSet, RecordStore};
use kiln_store::{Asset, ContentStore};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::context::{QueryContext, RequestScope};
use crate::error::QueryError;
use crate::inflight::InFlight;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    executions: AtomicU64,
    cache_hits: AtomicU64,
    waits: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters since the engine was opened, plus database totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub requests: u64,
    /// Compute functions run.
    pub executions: u64,
    pub cache_hits: u64,
    /// Times a caller blocked on another caller's computation.
    pub waits: u64,
    /// Computations running right now.
    pub in_flight: usize,
    /// Source file reads that went to disk.
    pub disk_reads: u64,
    pub db: DbStats,
}

/// What [`Engine::collect_garbage`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub records: usize,
    pub inputs: usize,
    pub blobs: usize,
}

/// Incremental build engine.
///
/// Shared between threads by reference (or `Arc`); every method takes
/// `&self`.
pub struct Engine {
    config: EngineConfig,
    /// Canonical cache directory; changes under it are the engine's own.
    cache_dir: PathBuf,
    store: ContentStore,
    db: Database,
    inflight: InFlight,
    counters: Counters,
    /// Set by the first storage failure; every later request fails with it.
    poisoned: OnceLock<QueryError>,
}

impl Engine {
    /// Opens the engine over `config.root`, with the database and blobs in
    /// the cache directory. Reconciles tracked inputs with the filesystem
    /// unless disabled.
    pub fn open(config: EngineConfig) -> Result<Self, QueryError> {
        let cache_dir = config.cache_dir();
        std::fs::create_dir_all(&cache_dir).map_err(kiln_db::StorageError::from)?;
        let db = Database::open_sqlite(config.db_path(), config.retry_policy())?;
        Self::assemble(config, db)
    }

    /// Opens the engine with records kept in `backend` instead of SQLite.
    pub fn with_backend(
        config: EngineConfig,
        backend: impl RecordStore + 'static,
    ) -> Result<Self, QueryError> {
        let db = Database::open(backend, config.retry_policy())?;
        Self::assemble(config, db)
    }

    /// An engine whose records do not outlive the process. Blobs are still
    /// written to the cache directory.
    pub fn in_memory(config: EngineConfig) -> Result<Self, QueryError> {
        Self::with_backend(config, InMemoryRecordStore::new())
    }

    fn assemble(config: EngineConfig, db: Database) -> Result<Self, QueryError> {
        let store = ContentStore::open(&config.root, config.blob_dir())?;
        // The blob directory inside it exists now.
        let cache_dir =
            std::fs::canonicalize(config.cache_dir()).unwrap_or_else(|_| config.cache_dir());
        let reconcile = config.reconcile_on_open;
        let engine = Engine {
            config,
            cache_dir,
            store,
            db,
            inflight: InFlight::new(),
            counters: Counters::default(),
            poisoned: OnceLock::new(),
        };
        info!(root = %engine.store.root().display(), revision = %engine.db.revision(), "engine ready");
        if reconcile {
            let report = engine.reconcile()?;
            if !report.is_empty() {
                info!(dirtied = report.dirtied.len(), "changes detected since last run");
            }
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub(crate) fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn check_poisoned(&self) -> Result<(), QueryError> {
        match self.poisoned.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Records a storage failure as fatal and returns the error every
    /// caller will see from now on.
    pub(crate) fn poison(&self, err: kiln_db::StorageError) -> QueryError {
        let err = QueryError::from(err);
        if self.poisoned.set(err.clone()).is_ok() {
            error!(error = %err, "storage failure, engine poisoned");
        }
        self.poisoned.get().cloned().unwrap_or(err)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }

    /// Runs `body` as one top-level request. Records produced by the
    /// request are committed together when it returns, whether or not it
    /// succeeded.
    pub fn request<T>(
        &self,
        body: impl FnOnce(&QueryContext<'_>) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        self.request_with_cancel(&CancelToken::new(), body)
    }

    pub fn request_with_cancel<T>(
        &self,
        cancel: &CancelToken,
        body: impl FnOnce(&QueryContext<'_>) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        self.check_poisoned()?;
        let scope = RequestScope::new(cancel.clone());
        let span = info_span!("request", id = %scope.id);
        let _entered = span.enter();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let result = {
            let ctx = QueryContext::top(self, &scope);
            body(&ctx)
        };

        match self.db.commit(scope.take_batch()) {
            Ok(written) => debug!(records = written, ok = result.is_ok(), "request finished"),
            Err(err) => return Err(self.poison(err)),
        }
        result
    }

    /// Shorthand for a request consisting of a single query.
    pub fn query<T, F>(&self, key: QueryKey, compute: F) -> Result<T, QueryError>
    where
        T: Serialize + serde::de::DeserializeOwned,
        F: FnOnce(&QueryContext<'_>) -> Result<T, QueryError>,
    {
        self.request(|ctx| ctx.query(key, |child| compute(child)))
    }

    /// Runs independent top-level requests on a pool of
    /// `config.workers` threads. Results come back in input order.
    pub fn run_parallel<T, F>(&self, requests: Vec<F>) -> Vec<Result<T, QueryError>>
    where
        T: Send,
        F: FnOnce(&QueryContext<'_>) -> Result<T, QueryError> + Send,
    {
        let count = requests.len();
        let workers = self.config.workers.clamp(1, count.max(1));
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, F)>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, Result<T, QueryError>)>();
        for job in requests.into_iter().enumerate() {
            // Both ends are alive here, so sending cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                s.spawn(move || {
                    for (index, body) in job_rx.iter() {
                        let _ = done_tx.send((index, self.request(body)));
                    }
                });
            }
        });
        drop(done_tx);

        let mut results: Vec<Option<Result<T, QueryError>>> = (0..count).map(|_| None).collect();
        for (index, result) in done_rx.iter() {
            results[index] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(QueryError::Cancelled)))
            .collect()
    }

    /// Sets a configuration value. Queries that read it through
    /// [`QueryContext::input`] are invalidated if the value changed.
    pub fn set_input<V: Serialize>(
        &self,
        name: &str,
        value: &V,
    ) -> Result<Option<InvalidationSet>, QueryError> {
        self.check_poisoned()?;
        let json = serde_json::to_vec(&serde_json::to_value(value)?)?;
        let hash = self.store.store(&json)?;
        self.db
            .set_input(name, hash)
            .map_err(|err| self.poison(err))
    }

    /// Retrieves generated content by hash.
    pub fn fetch(&self, hash: &ContentHash) -> Result<Asset, QueryError> {
        Ok(self.store.fetch(hash)?)
    }

    /// Removes records not reachable from `roots`, then every blob no
    /// surviving record references.
    pub fn collect_garbage(&self, roots: &[QueryKey]) -> Result<GcSummary, QueryError> {
        self.check_poisoned()?;
        let report = self
            .db
            .collect_garbage(roots)
            .map_err(|err| self.poison(err))?;
        let blobs = self.store.gc(&report.live_blobs)?;
        Ok(GcSummary {
            records: report.removed_records.len(),
            inputs: report.removed_inputs,
            blobs,
        })
    }

    /// Keys of memoized records whose query name is one of `names`; a
    /// convenient root set for [`Engine::collect_garbage`].
    pub fn records_named(&self, names: &[&str]) -> Vec<QueryKey> {
        self.db.keys_named(names)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            executions: self.counters.executions.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            in_flight: self.inflight.running(),
            disk_reads: self.store.disk_reads(),
            db: self.db.stats(),
        }
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        self.db.dependency_graph()
    }
}
