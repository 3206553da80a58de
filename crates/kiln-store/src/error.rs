//! Error types for content store operations.

use std::fmt;
use std::path::PathBuf;

use kiln_core::ContentHash;
use thiserror::Error;

/// Why a path could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathErrorKind {
    /// Nothing exists at the path.
    Missing,
    /// The path (after resolving `..` and symlinks) lies outside the root.
    EscapesRoot,
    /// The path exists but is the wrong kind of entry.
    NotADirectory,
}

impl fmt::Display for PathErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathErrorKind::Missing => f.write_str("no such file or directory"),
            PathErrorKind::EscapesRoot => f.write_str("path escapes the permitted root"),
            PathErrorKind::NotADirectory => f.write_str("not a directory"),
        }
    }
}

/// Errors produced by the content store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A path was unresolvable or unsafe.
    #[error("cannot resolve {}: {kind}", path.display())]
    Path { path: PathBuf, kind: PathErrorKind },

    /// No blob with this hash is stored.
    #[error("blob not found: {0}")]
    BlobNotFound(ContentHash),

    /// No content has been bound to this logical placeholder.
    #[error("placeholder not bound: '{0}'")]
    PlaceholderNotFound(String),

    /// A stored blob no longer hashes to its name.
    #[error("blob {expected} is corrupt (content hashes to {actual})")]
    Corrupt {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// An I/O error occurred while reading or writing store files.
    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the "absent" family: missing blobs and unbound placeholders.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BlobNotFound(_) | StoreError::PlaceholderNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_error_display() {
        let err = StoreError::Path {
            path: PathBuf::from("/site/../etc/passwd"),
            kind: PathErrorKind::EscapesRoot,
        };
        let msg = err.to_string();
        assert!(msg.contains("cannot resolve"));
        assert!(msg.contains("escapes the permitted root"));
    }

    #[test]
    fn not_found_family() {
        assert!(StoreError::BlobNotFound(ContentHash::of(b"x")).is_not_found());
        assert!(StoreError::PlaceholderNotFound("og.png".into()).is_not_found());
        let io = StoreError::io(
            "/tmp/blob",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!io.is_not_found());
        assert!(io.to_string().contains("store I/O error"));
    }
}
