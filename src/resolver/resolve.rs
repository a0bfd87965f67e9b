use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{normalize_path, sniff_format, AssetMapper, FileReader};
use crate::cache::{CacheStore, Handle, ImageBuffer};
use crate::error::ResolveError;
use crate::models::{ImageKind, ImageRecord};

/// Resolves record paths into handles.
///
/// Owned buffers are registered with the cache store's retention set before
/// they are returned.
pub struct PathResolver {
    reader: Arc<dyn FileReader>,
    assets: Option<Arc<dyn AssetMapper>>,
    store: Arc<CacheStore>,
    prefer_assets: bool,
}

impl PathResolver {
    pub fn new(reader: Arc<dyn FileReader>, store: Arc<CacheStore>) -> Self {
        Self {
            reader,
            assets: None,
            store,
            prefer_assets: false,
        }
    }

    /// Enables zero-copy references through `mapper`.
    pub fn with_assets(mut self, mapper: Arc<dyn AssetMapper>, prefer: bool) -> Self {
        self.assets = Some(mapper);
        self.prefer_assets = prefer;
        self
    }

    /// Resolves `kind` for a record, trying each candidate path in order.
    ///
    /// A failing declared thumbnail falls back to the original file; the
    /// error of the last candidate is returned.
    pub async fn resolve(&self, record: &ImageRecord, kind: ImageKind) -> Result<Handle, ResolveError> {
        let candidates = record.candidate_paths(kind);
        let last = candidates.len().saturating_sub(1);
        let mut last_err = ResolveError::EmptyPath;

        for (i, path) in candidates.into_iter().enumerate() {
            match self.resolve_path(path, kind).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    if i < last {
                        debug!(id = %record.id, ?path, error = %e, "Thumbnail failed, falling back to original");
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Resolves a single path.
    pub async fn resolve_path(&self, raw: &Path, kind: ImageKind) -> Result<Handle, ResolveError> {
        let path = normalize_path(raw).ok_or(ResolveError::EmptyPath)?;
        trace!(?path, %kind, "Resolving");

        if self.prefer_assets {
            if let Some(mapper) = &self.assets {
                if let Some(handle) = self.try_asset(mapper.as_ref(), &path).await? {
                    return Ok(handle);
                }
            }
        }

        let bytes = self
            .reader
            .read_bytes(&path)
            .await
            .map_err(|source| ResolveError::Io {
                path: path.clone(),
                source,
            })?;
        let format = sniff_format(&bytes).ok_or_else(|| ResolveError::InvalidFormat { path: path.clone() })?;

        Ok(self.store.retain_buffer(ImageBuffer::new(bytes, format)))
    }

    /// A mapper failure yields `Ok(None)` so the caller reads bytes instead.
    async fn try_asset(&self, mapper: &dyn AssetMapper, path: &Path) -> Result<Option<Handle>, ResolveError> {
        let len = self.reader.len(path).await.map_err(|source| ResolveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if len == 0 {
            return Err(ResolveError::InvalidFormat {
                path: path.to_path_buf(),
            });
        }
        match mapper.asset_url(path) {
            Ok(url) => Ok(Some(Handle::Asset { url })),
            Err(e) => {
                debug!(?path, error = %e, "Asset mapping failed, reading bytes");
                Ok(None)
            }
        }
    }
}
