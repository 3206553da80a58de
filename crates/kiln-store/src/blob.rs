//! On-disk blob directory.
//!
//! Layout:
//!
//! ```text
//! <root>/objects/<first 2 hex chars>/<remaining 62 hex chars>
//! <root>/names/<hex of blake3(logical name)>
//! ```
//!
//! Objects are written to a temp file in the same directory tree and
//! renamed into place, so a reader never observes a half-written blob. A
//! name file holds the bound hash on its first line and the logical name on
//! its second.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use kiln_core::ContentHash;
use tracing::{debug, warn};

use crate::error::StoreError;

const OBJECTS_DIR: &str = "objects";
const NAMES_DIR: &str = "names";
const TMP_DIR: &str = "tmp";

/// Hash-named blob storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct BlobDir {
    root: PathBuf,
}

impl BlobDir {
    /// Opens (creating if needed) a blob directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in [OBJECTS_DIR, NAMES_DIR, TMP_DIR] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(BlobDir { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where the blob for `hash` lives.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..])
    }

    fn name_path(&self, logical: &str) -> PathBuf {
        self.root
            .join(NAMES_DIR)
            .join(ContentHash::of(logical.as_bytes()).to_hex())
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.object_path(hash).is_file()
    }

    /// Writes `bytes` under `hash` unless already present.
    ///
    /// Returns `true` if a new object was written.
    pub fn write(&self, hash: &ContentHash, bytes: &[u8]) -> Result<bool, StoreError> {
        let target = self.object_path(hash);
        if target.is_file() {
            return Ok(false);
        }
        let parent = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        self.write_atomic(&target, bytes)?;
        debug!(hash = %hash, size = bytes.len(), "wrote blob");
        Ok(true)
    }

    /// Reads the blob for `hash`, verifying its content.
    pub fn read(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(*hash));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let actual = ContentHash::of(&bytes);
        if actual != *hash {
            return Err(StoreError::Corrupt {
                expected: *hash,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Binds a logical name to a hash, replacing any earlier binding.
    pub fn bind_name(&self, logical: &str, hash: &ContentHash) -> Result<(), StoreError> {
        let contents = format!("{}\n{}\n", hash.to_hex(), logical);
        self.write_atomic(&self.name_path(logical), contents.as_bytes())
    }

    /// Looks up the hash bound to a logical name.
    pub fn lookup_name(&self, logical: &str) -> Result<Option<ContentHash>, StoreError> {
        let path = self.name_path(logical);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let first = contents.lines().next().unwrap_or_default();
        match ContentHash::from_hex(first) {
            Ok(hash) => Ok(Some(hash)),
            Err(_) => {
                warn!(name = logical, "ignoring malformed name binding");
                Ok(None)
            }
        }
    }

    /// Lists the hashes of every stored object.
    pub fn list(&self) -> Result<Vec<ContentHash>, StoreError> {
        let objects = self.root.join(OBJECTS_DIR);
        let mut hashes = Vec::new();
        for shard in read_dir(&objects)? {
            if !shard.is_dir() {
                continue;
            }
            let Some(prefix) = shard.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for object in read_dir(&shard)? {
                let Some(rest) = object.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Ok(hash) = ContentHash::from_hex(&format!("{prefix}{rest}")) {
                    hashes.push(hash);
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Removes every object not in `live`, and every name binding pointing
    /// at a removed object. Returns the number of objects removed.
    pub fn gc(&self, live: &HashSet<ContentHash>) -> Result<usize, StoreError> {
        let mut removed = HashSet::new();
        for hash in self.list()? {
            if live.contains(&hash) {
                continue;
            }
            let path = self.object_path(&hash);
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            removed.insert(hash);
        }

        let names = self.root.join(NAMES_DIR);
        for entry in read_dir(&names)? {
            let bound = std::fs::read_to_string(&entry)
                .ok()
                .and_then(|s| s.lines().next().and_then(|l| ContentHash::from_hex(l).ok()));
            match bound {
                Some(hash) if !removed.contains(&hash) => {}
                _ => {
                    std::fs::remove_file(&entry).map_err(|e| StoreError::io(&entry, e))?;
                }
            }
        }

        if !removed.is_empty() {
            debug!(removed = removed.len(), "collected blobs");
        }
        Ok(removed.len())
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp_dir = self.root.join(TMP_DIR);
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| StoreError::io(&tmp_dir, e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_data())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(target)
            .map_err(|e| StoreError::io(target, e.error))?;
        Ok(())
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        paths.push(entry.path());
    }
    Ok(paths)
}
