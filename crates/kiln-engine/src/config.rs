//! Engine configuration.
//!
//! Defaults suit a site rooted at the working directory. [`EngineConfig`]
//! is `Deserialize` so a configuration loader can embed it in a larger
//! file, and [`EngineConfig::from_env`] reads the `KILN_*` variables:
//!
//! - `KILN_ROOT`: content root (default: ".")
//! - `KILN_CACHE_DIR`: cache directory (default: "<root>/.kiln")
//! - `KILN_WORKERS`: worker threads for `run_parallel` (default: available
//!   parallelism)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use kiln_db::RetryPolicy;

const DB_FILE: &str = "kiln.db";
const BLOB_DIR: &str = "blobs";
const DEFAULT_CACHE_DIR: &str = ".kiln";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidVar { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory source paths are resolved against; reads may not escape it.
    pub root: PathBuf,
    /// Where the database and blobs live. Defaults to `<root>/.kiln`.
    pub cache_dir: Option<PathBuf>,
    /// Worker threads for [`crate::Engine::run_parallel`].
    pub workers: usize,
    /// How often a blocked waiter re-checks its cancel token.
    pub wait_poll_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Compare tracked inputs with the filesystem when opening.
    pub reconcile_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            root: PathBuf::from("."),
            cache_dir: None,
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            wait_poll_ms: 50,
            retry_attempts: RetryPolicy::default().attempts,
            retry_base_delay_ms: 10,
            reconcile_on_open: true,
        }
    }
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Defaults overridden by any `KILN_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();
        if let Some(root) = get("KILN_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(dir) = get("KILN_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = get("KILN_WORKERS") {
            config.workers = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        var: "KILN_WORKERS",
                        value: raw,
                    })
                }
            };
        }
        Ok(config)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.root.join(DEFAULT_CACHE_DIR))
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_dir().join(DB_FILE)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.cache_dir().join(BLOB_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }
}
