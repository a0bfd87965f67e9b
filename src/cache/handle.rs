//! Displayable handles and the blob registry that backs owned buffers.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::{ImageFormat, ImageReader};
use parking_lot::Mutex;
use tracing::{trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::models::ImageKind;

/// Leading bytes hashed into a blob reference.
const BLOB_HASH_PREFIX: usize = 4096;

/// Bytes read from disk whose signature names a known image format.
#[derive(Debug)]
pub struct ImageBuffer {
    bytes: Vec<u8>,
    format: ImageFormat,
    dimensions: Option<(u32, u32)>,
}

impl ImageBuffer {
    /// Wraps sniffed bytes, probing the header for pixel dimensions.
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        let dimensions = ImageReader::with_format(Cursor::new(bytes.as_slice()), format)
            .into_dimensions()
            .ok();
        Self {
            bytes,
            format,
            dimensions,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// Pixel dimensions, when the header could be parsed.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A displayable reference to an image resource.
#[derive(Debug, Clone)]
pub enum Handle {
    /// Zero-copy reference the view layer can load directly.
    Asset { url: String },
    /// Owned buffer published under a blob reference.
    Buffer { url: String, buffer: Arc<ImageBuffer> },
}

impl Handle {
    pub fn url(&self) -> &str {
        match self {
            Self::Asset { url } | Self::Buffer { url, .. } => url,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Buffer { .. })
    }

    pub fn buffer(&self) -> Option<&Arc<ImageBuffer>> {
        match self {
            Self::Buffer { buffer, .. } => Some(buffer),
            Self::Asset { .. } => None,
        }
    }

    /// Bytes kept alive by this handle.
    pub fn memory_bytes(&self) -> usize {
        self.buffer().map_or(0, |b| b.len())
    }
}

/// Resolved handles for one record.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub thumbnail: Option<Handle>,
    pub original: Option<Handle>,
}

impl CacheEntry {
    pub fn get(&self, kind: ImageKind) -> Option<&Handle> {
        match kind {
            ImageKind::Thumbnail => self.thumbnail.as_ref(),
            ImageKind::Original => self.original.as_ref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: ImageKind) -> &mut Option<Handle> {
        match kind {
            ImageKind::Thumbnail => &mut self.thumbnail,
            ImageKind::Original => &mut self.original,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.thumbnail.is_none() && self.original.is_none()
    }

    pub(crate) fn into_handles(self) -> impl Iterator<Item = Handle> {
        self.thumbnail.into_iter().chain(self.original)
    }
}

/// Publishes owned buffers under reference strings the view layer can load.
///
/// `revoke` is the release primitive; only the cache store calls it.
pub trait BlobRegistry: Send + Sync {
    fn create(&self, buffer: &Arc<ImageBuffer>) -> String;

    /// Returns false if `url` was not live.
    fn revoke(&self, url: &str) -> bool;
}

/// In-process registry mapping `blob:` references to their buffers.
pub struct LocalBlobRegistry {
    live: Mutex<HashMap<String, Arc<ImageBuffer>>>,
    seq: AtomicU64,
}

impl LocalBlobRegistry {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Looks up the buffer behind a live reference.
    pub fn lookup(&self, url: &str) -> Option<Arc<ImageBuffer>> {
        self.live.lock().get(url).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for LocalBlobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobRegistry for LocalBlobRegistry {
    fn create(&self, buffer: &Arc<ImageBuffer>) -> String {
        let head = &buffer.bytes()[..buffer.len().min(BLOB_HASH_PREFIX)];
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let url = format!("blob:gridcache/{:016x}-{}", xxh3_64(head), seq);
        self.live.lock().insert(url.clone(), Arc::clone(buffer));
        trace!(%url, bytes = buffer.len(), "Created blob reference");
        url
    }

    fn revoke(&self, url: &str) -> bool {
        let removed = self.live.lock().remove(url).is_some();
        if !removed {
            warn!(%url, "Revoke for unknown blob reference");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::encode_image;

    #[test]
    fn test_buffer_probes_dimensions() {
        let buffer = ImageBuffer::new(encode_image(ImageFormat::Png, 3, 2), ImageFormat::Png);
        assert_eq!(buffer.dimensions(), Some((3, 2)));
        assert_eq!(buffer.mime_type(), "image/png");
    }

    #[test]
    fn test_truncated_header_has_no_dimensions() {
        let buffer = ImageBuffer::new(vec![0xFF, 0xD8, 0xFF], ImageFormat::Jpeg);
        assert_eq!(buffer.dimensions(), None);
        assert_eq!(buffer.mime_type(), "image/jpeg");
    }

    #[test]
    fn test_registry_revokes_once() {
        let registry = LocalBlobRegistry::new();
        let buffer = Arc::new(ImageBuffer::new(
            encode_image(ImageFormat::Png, 1, 1),
            ImageFormat::Png,
        ));
        let a = registry.create(&buffer);
        let b = registry.create(&buffer);
        assert_ne!(a, b);
        assert!(a.starts_with("blob:gridcache/"));
        assert_eq!(registry.live_count(), 2);

        assert!(registry.revoke(&a));
        assert!(!registry.revoke(&a));
        assert!(registry.lookup(&b).is_some());
    }

    #[test]
    fn test_entry_slots_are_independent() {
        let mut entry = CacheEntry::default();
        *entry.slot_mut(ImageKind::Original) = Some(Handle::Asset { url: "asset://o".into() });
        assert!(entry.get(ImageKind::Thumbnail).is_none());
        assert_eq!(entry.get(ImageKind::Original).map(Handle::url), Some("asset://o"));
    }
}
