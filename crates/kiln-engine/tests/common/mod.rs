//! Scratch sites for engine tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use kiln_engine::{Engine, EngineConfig, QueryKey};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn key(name: &str, arg: &str) -> QueryKey {
    QueryKey::new(name, [arg]).unwrap()
}

/// A content root and a cache directory side by side in one temp dir.
pub struct Site {
    dir: tempfile::TempDir,
    root: PathBuf,
}

impl Site {
    pub fn new(files: &[(&str, &str)]) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site");
        std::fs::create_dir_all(&root).unwrap();
        let root = std::fs::canonicalize(root).unwrap();
        let site = Site { dir, root };
        for (name, body) in files {
            site.write(name, body);
        }
        site
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, body: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.path(rel)).unwrap();
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.root).with_cache_dir(self.dir.path().join("cache"));
        config.wait_poll_ms = 5;
        config.retry_base_delay_ms = 1;
        config
    }

    /// Like [`Site::config`] but with the default cache directory, which
    /// lives inside the content root.
    pub fn config_in_root(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.root);
        config.wait_poll_ms = 5;
        config.retry_base_delay_ms = 1;
        config
    }

    /// An engine over the SQLite database in the cache directory.
    pub fn open(&self) -> Engine {
        Engine::open(self.config()).unwrap()
    }

    pub fn in_memory(&self) -> Engine {
        Engine::in_memory(self.config()).unwrap()
    }
}
