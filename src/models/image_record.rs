use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, globally unique record key assigned by the collection service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Arc<str>);

impl ImageId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ImageId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Which variant of a record a handle displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageKind {
    Thumbnail,
    Original,
}

impl ImageKind {
    pub const ALL: [ImageKind; 2] = [ImageKind::Thumbnail, ImageKind::Original];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Original => "original",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image record as supplied by the collection service.
///
/// `local_path` may point at a file that no longer exists; that surfaces as a
/// resolution failure for the record, never as a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    pub local_path: PathBuf,
    #[serde(default)]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default)]
    pub crawled_at: i64,
    #[serde(default)]
    pub favorite: bool,
}

impl ImageRecord {
    pub fn new(id: impl Into<ImageId>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            local_path: local_path.into(),
            thumbnail_path: None,
            crawled_at: 0,
            favorite: false,
        }
    }

    pub fn with_thumbnail(mut self, path: impl Into<PathBuf>) -> Self {
        self.thumbnail_path = Some(path.into());
        self
    }

    pub fn with_crawled_at(mut self, crawled_at: i64) -> Self {
        self.crawled_at = crawled_at;
        self
    }

    /// The declared thumbnail path, ignoring blank values.
    pub fn declared_thumbnail(&self) -> Option<&Path> {
        self.thumbnail_path
            .as_deref()
            .filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
    }

    /// Candidate paths to try for `kind`, in order.
    ///
    /// Thumbnails fall back to the original file as a last resort; originals
    /// never fall back to the thumbnail.
    pub fn candidate_paths(&self, kind: ImageKind) -> Vec<&Path> {
        match kind {
            ImageKind::Original => vec![self.local_path.as_path()],
            ImageKind::Thumbnail => match self.declared_thumbnail() {
                Some(thumb) if thumb != self.local_path.as_path() => {
                    vec![thumb, self.local_path.as_path()]
                }
                _ => vec![self.local_path.as_path()],
            },
        }
    }
}
