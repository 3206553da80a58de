//! Canonical asset paths.
//!
//! [`CanonicalPath`] is the identity of a physical file inside the content
//! store. The content store produces them from the filesystem; this module
//! only provides the lexical part (collapsing `.` and `..`), which never
//! touches the disk and never fails.

use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// An absolute, normalized path identifying one physical file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    /// Wraps a path that is already canonical (e.g. the output of
    /// `std::fs::canonicalize`).
    pub fn from_canonical(path: impl Into<PathBuf>) -> Self {
        CanonicalPath(path.into())
    }

    /// Lexically canonicalizes `path` against `base` without touching the
    /// filesystem. Symlinks are not resolved.
    pub fn lexical(path: impl AsRef<Path>, base: &Path) -> Self {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        };
        CanonicalPath(normalize_path(joined))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The final component, if it is valid UTF-8.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|s| s.to_str())
    }

    /// The file name without its extension.
    pub fn file_stem(&self) -> Option<&str> {
        self.0.file_stem().and_then(|s| s.to_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension().and_then(|s| s.to_str())
    }

    /// The containing directory.
    pub fn parent(&self) -> Option<CanonicalPath> {
        self.0.parent().map(|p| CanonicalPath(p.to_path_buf()))
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl Deref for CanonicalPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Collapses `.` and `..` components and repeated separators.
///
/// `..` at the start of a relative path is kept; `..` directly under the
/// root is dropped.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let mut components = path.as_ref().components().peekable();
    let mut out = match components.peek() {
        Some(Component::Prefix(prefix)) => {
            let prefix = PathBuf::from(prefix.as_os_str());
            components.next();
            prefix
        }
        _ => PathBuf::new(),
    };

    for component in components {
        match component {
            Component::Prefix(_) => {}
            Component::RootDir => out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.ends_with(Component::ParentDir) {
                    out.push(Component::ParentDir);
                } else if !out.pop() && !out.has_root() {
                    out.push(Component::ParentDir);
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
