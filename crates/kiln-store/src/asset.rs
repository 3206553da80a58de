//! Asset values handed out by the content store.

use std::sync::Arc;

use kiln_core::{CanonicalPath, ContentHash};

/// Coarse content classification, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Markdown,
    Html,
    Css,
    JavaScript,
    Image,
    Font,
    Data,
    Text,
    Other,
}

impl AssetKind {
    /// Classifies by extension (case-insensitive).
    pub fn from_extension(ext: Option<&str>) -> Self {
        let Some(ext) = ext else {
            return AssetKind::Other;
        };
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => AssetKind::Markdown,
            "html" | "htm" => AssetKind::Html,
            "css" => AssetKind::Css,
            "js" | "mjs" => AssetKind::JavaScript,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico" => AssetKind::Image,
            "woff" | "woff2" | "ttf" | "otf" => AssetKind::Font,
            "json" | "toml" | "yaml" | "yml" | "csv" => AssetKind::Data,
            "txt" => AssetKind::Text,
            _ => AssetKind::Other,
        }
    }

    /// The MIME type served for this kind.
    pub fn mime(&self) -> &'static str {
        match self {
            AssetKind::Markdown => "text/markdown",
            AssetKind::Html => "text/html",
            AssetKind::Css => "text/css",
            AssetKind::JavaScript => "text/javascript",
            AssetKind::Image => "image/*",
            AssetKind::Font => "font/*",
            AssetKind::Data => "application/octet-stream",
            AssetKind::Text => "text/plain",
            AssetKind::Other => "application/octet-stream",
        }
    }
}

/// Where an asset's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOrigin {
    /// Read from a source file.
    File(CanonicalPath),
    /// Produced by a generation step and stored as a blob.
    Generated,
}

/// An immutable unit of content.
///
/// A changed file produces a new `Asset` with a new hash; existing values are
/// never mutated.
#[derive(Debug, Clone)]
pub struct Asset {
    pub origin: AssetOrigin,
    pub hash: ContentHash,
    pub kind: AssetKind,
    bytes: Arc<[u8]>,
}

impl Asset {
    pub(crate) fn from_file(path: CanonicalPath, bytes: Vec<u8>) -> Self {
        let kind = AssetKind::from_extension(path.extension());
        Asset {
            hash: ContentHash::of(&bytes),
            origin: AssetOrigin::File(path),
            kind,
            bytes: bytes.into(),
        }
    }

    pub(crate) fn generated(hash: ContentHash, bytes: Arc<[u8]>) -> Self {
        Asset {
            origin: AssetOrigin::Generated,
            hash,
            kind: AssetKind::Other,
            bytes,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle to the bytes.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The source path, for file assets.
    pub fn path(&self) -> Option<&CanonicalPath> {
        match &self.origin {
            AssetOrigin::File(path) => Some(path),
            AssetOrigin::Generated => None,
        }
    }
}

/// The member set of a directory at the moment it was listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub dir: CanonicalPath,
    /// Members sorted by path.
    pub entries: Vec<CanonicalPath>,
    /// Hash over the member names; changes iff a member is added or removed.
    pub fingerprint: ContentHash,
}

impl Listing {
    pub(crate) fn new(dir: CanonicalPath, mut entries: Vec<CanonicalPath>) -> Self {
        entries.sort();
        let names: Vec<String> = entries.iter().map(|e| e.display().to_string()).collect();
        let fingerprint = ContentHash::of_parts(names.iter().map(|n| n.as_bytes()));
        Listing {
            dir,
            entries,
            fingerprint,
        }
    }

    /// Members whose extension matches `ext`.
    pub fn with_extension<'a>(&'a self, ext: &'a str) -> impl Iterator<Item = &'a CanonicalPath> {
        self.entries
            .iter()
            .filter(move |e| e.extension() == Some(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_extension() {
        assert_eq!(AssetKind::from_extension(Some("md")), AssetKind::Markdown);
        assert_eq!(AssetKind::from_extension(Some("PNG")), AssetKind::Image);
        assert_eq!(AssetKind::from_extension(Some("woff2")), AssetKind::Font);
        assert_eq!(AssetKind::from_extension(Some("rs")), AssetKind::Other);
        assert_eq!(AssetKind::from_extension(None), AssetKind::Other);
        assert_eq!(AssetKind::Css.mime(), "text/css");
    }

    #[test]
    fn file_asset_hashes_its_bytes() {
        let asset = Asset::from_file(
            CanonicalPath::from_canonical("/site/a.txt"),
            b"v1".to_vec(),
        );
        assert_eq!(asset.hash, ContentHash::of(b"v1"));
        assert_eq!(asset.size(), 2);
        assert_eq!(asset.kind, AssetKind::Text);
        assert_eq!(asset.path().unwrap().file_name(), Some("a.txt"));
    }

    #[test]
    fn listing_fingerprint_tracks_membership_not_order() {
        let a = CanonicalPath::from_canonical("/posts/a.md");
        let b = CanonicalPath::from_canonical("/posts/b.md");
        let dir = CanonicalPath::from_canonical("/posts");
        let l1 = Listing::new(dir.clone(), vec![a.clone(), b.clone()]);
        let l2 = Listing::new(dir.clone(), vec![b.clone(), a.clone()]);
        let l3 = Listing::new(dir, vec![a]);
        assert_eq!(l1.fingerprint, l2.fingerprint);
        assert_ne!(l1.fingerprint, l3.fingerprint);
        assert_eq!(l1.with_extension("md").count(), 2);
    }
}
