//! The content store: path resolution, the per-process read cache and the
//! blob directory behind one handle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use kiln_core::{CanonicalPath, ContentHash};

use crate::asset::{Asset, Listing};
use crate::blob::BlobDir;
use crate::error::{PathErrorKind, StoreError};

/// Content-addressed asset store.
///
/// Source files are read at most once per process until invalidated.
/// Generated bytes are persisted as blobs keyed by the hash of the final
/// bytes. All methods take `&self`; the store is shared between threads.
pub struct ContentStore {
    /// Canonical permitted root; every resolved path lies under it.
    root: PathBuf,
    blobs: BlobDir,
    files: DashMap<CanonicalPath, Asset>,
    disk_reads: AtomicU64,
}

impl ContentStore {
    /// Opens a store serving files under `root` and keeping blobs in
    /// `blob_dir`.
    pub fn open(root: impl AsRef<Path>, blob_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root_ref = root.as_ref();
        let root = std::fs::canonicalize(root_ref).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::Path {
                path: root_ref.to_path_buf(),
                kind: PathErrorKind::Missing,
            },
            _ => StoreError::io(root_ref, e),
        })?;
        let blobs = BlobDir::open(blob_dir)?;
        debug!(root = %root.display(), blobs = %blobs.root().display(), "opened content store");
        Ok(ContentStore {
            root,
            blobs,
            files: DashMap::new(),
            disk_reads: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobDir {
        &self.blobs
    }

    /// Maps a relative or absolute reference to the canonical identity of the
    /// physical file.
    ///
    /// Relative paths are taken relative to the root. `..` and symlinks are
    /// resolved; the result must exist and lie under the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<CanonicalPath, StoreError> {
        let lexical = self.lexical(path);
        if !lexical.starts_with(&self.root) {
            return Err(StoreError::Path {
                path: lexical.into_path_buf(),
                kind: PathErrorKind::EscapesRoot,
            });
        }
        let physical = std::fs::canonicalize(&lexical).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::Path {
                path: lexical.to_path_buf(),
                kind: PathErrorKind::Missing,
            },
            _ => StoreError::io(lexical.as_path(), e),
        })?;
        if !physical.starts_with(&self.root) {
            return Err(StoreError::Path {
                path: physical,
                kind: PathErrorKind::EscapesRoot,
            });
        }
        Ok(CanonicalPath::from_canonical(physical))
    }

    /// Lexical canonicalization against the root, for paths that may no
    /// longer exist (e.g. in removal notifications).
    pub fn lexical(&self, path: impl AsRef<Path>) -> CanonicalPath {
        CanonicalPath::lexical(path, &self.root)
    }

    /// Returns the bytes and hash of a source file, reading the disk only on
    /// the first call for `path` since it was last invalidated.
    pub fn read(&self, path: &CanonicalPath) -> Result<Asset, StoreError> {
        if let Some(asset) = self.files.get(path) {
            trace!(path = %path, "read cache hit");
            return Ok(asset.clone());
        }
        match self.files.entry(path.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let bytes = std::fs::read(path.as_path()).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => StoreError::Path {
                        path: path.to_path_buf(),
                        kind: PathErrorKind::Missing,
                    },
                    _ => StoreError::io(path.as_path(), e),
                })?;
                self.disk_reads.fetch_add(1, Ordering::Relaxed);
                let asset = Asset::from_file(path.clone(), bytes);
                debug!(path = %path, hash = %asset.hash, size = asset.size(), "read source file");
                Ok(entry.insert(asset).clone())
            }
        }
    }

    /// Drops the cached bytes for `path`. Returns the hash that was cached.
    pub fn invalidate(&self, path: &CanonicalPath) -> Option<ContentHash> {
        self.files.remove(path).map(|(_, asset)| asset.hash)
    }

    /// Drops every cached file.
    pub fn invalidate_all(&self) {
        self.files.clear();
    }

    /// Number of source file reads that went to disk.
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// Current hash of a file, bypassing and refreshing the cache.
    ///
    /// Returns `None` if the file no longer exists.
    pub fn rehash(&self, path: &CanonicalPath) -> Result<Option<ContentHash>, StoreError> {
        self.invalidate(path);
        match self.read(path) {
            Ok(asset) => Ok(Some(asset.hash)),
            Err(StoreError::Path {
                kind: PathErrorKind::Missing,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persists generated bytes and returns the hash of those final bytes.
    pub fn store(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(bytes);
        self.blobs.write(&hash, bytes)?;
        Ok(hash)
    }

    /// Persists generated bytes and binds them to a stable logical name.
    ///
    /// A generation step that has to mention its own output before it is
    /// finished refers to `logical`; the name resolves to the hash once this
    /// call returns.
    pub fn store_named(&self, logical: &str, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = self.store(bytes)?;
        self.blobs.bind_name(logical, &hash)?;
        Ok(hash)
    }

    /// Resolves a logical placeholder to the hash of its generated content.
    pub fn placeholder(&self, logical: &str) -> Result<ContentHash, StoreError> {
        self.blobs
            .lookup_name(logical)?
            .ok_or_else(|| StoreError::PlaceholderNotFound(logical.to_string()))
    }

    /// Retrieves previously stored content.
    pub fn fetch(&self, hash: &ContentHash) -> Result<Asset, StoreError> {
        let bytes = self.blobs.read(hash)?;
        Ok(Asset::generated(*hash, Arc::from(bytes)))
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blobs.contains(hash)
    }

    /// Lists the members of a directory.
    pub fn list_dir(&self, dir: &CanonicalPath) -> Result<Listing, StoreError> {
        if !dir.is_dir() {
            let kind = if dir.exists() {
                PathErrorKind::NotADirectory
            } else {
                PathErrorKind::Missing
            };
            return Err(StoreError::Path {
                path: dir.to_path_buf(),
                kind,
            });
        }
        let entries = std::fs::read_dir(dir.as_path()).map_err(|e| StoreError::io(dir.as_path(), e))?;
        let mut members = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir.as_path(), e))?;
            members.push(CanonicalPath::from_canonical(entry.path()));
        }
        Ok(Listing::new(dir.clone(), members))
    }

    /// Current listing fingerprint of a directory, or `None` if it is gone.
    pub fn listing_fingerprint(&self, dir: &CanonicalPath) -> Result<Option<ContentHash>, StoreError> {
        match self.list_dir(dir) {
            Ok(listing) => Ok(Some(listing.fingerprint)),
            Err(StoreError::Path { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes every blob not in `live`.
    pub fn gc(&self, live: &std::collections::HashSet<ContentHash>) -> Result<usize, StoreError> {
        self.blobs.gc(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        std::fs::create_dir_all(site.join("posts")).unwrap();
        std::fs::write(site.join("a.txt"), "v1").unwrap();
        std::fs::write(site.join("posts/first.md"), "# First").unwrap();
        let store = ContentStore::open(&site, dir.path().join("cache/blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn resolve_collapses_relative_references() {
        let (_dir, store) = make_store();
        let a = store.resolve("a.txt").unwrap();
        let b = store.resolve("posts/../a.txt").unwrap();
        let c = store.resolve(store.root().join("./a.txt")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_follows_symlinks_to_one_identity() {
        let (_dir, store) = make_store();
        std::os::unix::fs::symlink(store.root().join("a.txt"), store.root().join("alias.txt")).unwrap();
        assert_eq!(store.resolve("alias.txt").unwrap(), store.resolve("a.txt").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escaping_root() {
        let (dir, store) = make_store();
        std::fs::write(dir.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), store.root().join("leak.txt")).unwrap();
        let err = store.resolve("leak.txt").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Path {
                kind: PathErrorKind::EscapesRoot,
                ..
            }
        ));
    }

    #[test]
    fn resolve_rejects_missing_and_escaping() {
        let (_dir, store) = make_store();
        assert!(matches!(
            store.resolve("nope.txt").unwrap_err(),
            StoreError::Path {
                kind: PathErrorKind::Missing,
                ..
            }
        ));
        assert!(matches!(
            store.resolve("../secret.txt").unwrap_err(),
            StoreError::Path {
                kind: PathErrorKind::EscapesRoot,
                ..
            }
        ));
    }

    #[test]
    fn read_hits_disk_once_until_invalidated() {
        let (_dir, store) = make_store();
        let path = store.resolve("a.txt").unwrap();

        let first = store.read(&path).unwrap();
        let second = store.read(&path).unwrap();
        assert_eq!(first.bytes(), b"v1");
        assert_eq!(first.hash, second.hash);
        assert_eq!(store.disk_reads(), 1);

        std::fs::write(path.as_path(), "v2").unwrap();
        // Still cached: the change has not been reported.
        assert_eq!(store.read(&path).unwrap().bytes(), b"v1");

        assert_eq!(store.invalidate(&path), Some(ContentHash::of(b"v1")));
        let third = store.read(&path).unwrap();
        assert_eq!(third.bytes(), b"v2");
        assert_eq!(third.hash, ContentHash::of(b"v2"));
        assert_eq!(store.disk_reads(), 2);
    }

    #[test]
    fn rehash_reports_deleted_files() {
        let (_dir, store) = make_store();
        let path = store.resolve("a.txt").unwrap();
        assert_eq!(store.rehash(&path).unwrap(), Some(ContentHash::of(b"v1")));
        std::fs::remove_file(path.as_path()).unwrap();
        assert_eq!(store.rehash(&path).unwrap(), None);
    }

    #[test]
    fn store_is_content_addressed() {
        let (_dir, store) = make_store();
        let h1 = store.store(b"generated").unwrap();
        let h2 = store.store(b"generated").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1, ContentHash::of(b"generated"));
        assert_eq!(store.blobs().list().unwrap().len(), 1);
        assert_eq!(store.fetch(&h1).unwrap().bytes(), b"generated");
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.fetch(&ContentHash::of(b"never stored")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn placeholders_resolve_after_generation() {
        let (_dir, store) = make_store();
        assert!(store.placeholder("og/page1.png").unwrap_err().is_not_found());
        let hash = store.store_named("og/page1.png", b"png bytes").unwrap();
        assert_eq!(store.placeholder("og/page1.png").unwrap(), hash);
    }

    #[test]
    fn listing_changes_with_membership() {
        let (_dir, store) = make_store();
        let posts = store.resolve("posts").unwrap();
        let before = store.list_dir(&posts).unwrap();
        assert_eq!(before.entries.len(), 1);

        std::fs::write(posts.join("first.md"), "# First, edited").unwrap();
        assert_eq!(store.list_dir(&posts).unwrap().fingerprint, before.fingerprint);

        std::fs::write(posts.join("second.md"), "# Second").unwrap();
        let after = store.list_dir(&posts).unwrap();
        assert_eq!(after.entries.len(), 2);
        assert_ne!(after.fingerprint, before.fingerprint);
    }

    #[test]
    fn list_dir_rejects_files() {
        let (_dir, store) = make_store();
        let file = store.resolve("a.txt").unwrap();
        assert!(matches!(
            store.list_dir(&file).unwrap_err(),
            StoreError::Path {
                kind: PathErrorKind::NotADirectory,
                ..
            }
        ));
    }
}
