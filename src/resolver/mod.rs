//! Path to handle resolution.
//!
//! This module provides:
//! - `PathResolver` - Turns record paths into displayable handles
//! - `FileReader` / `AssetMapper` - The I/O primitives it is built on
//! - `normalize_path` / `sniff_format` - Path cleanup and signature checks

pub mod path;
pub mod resolve;
pub mod sniff;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

pub use path::normalize_path;
pub use resolve::PathResolver;
pub use sniff::sniff_format;

/// Byte-level file access. Paths are normalized before they reach it.
#[async_trait]
pub trait FileReader: Send + Sync {
    async fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// File length without reading contents.
    async fn len(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads through `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileReader;

#[async_trait]
impl FileReader for TokioFileReader {
    async fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn len(&self, path: &Path) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }
}

/// Zero-copy path to reference mapping.
pub trait AssetMapper: Send + Sync {
    fn asset_url(&self, path: &Path) -> Result<String>;
}

/// Maps paths onto a custom URL scheme served by the host webview.
#[derive(Debug, Clone)]
pub struct AssetProtocol {
    scheme: String,
}

impl AssetProtocol {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
        }
    }
}

impl Default for AssetProtocol {
    fn default() -> Self {
        Self::new("asset")
    }
}

impl AssetMapper for AssetProtocol {
    fn asset_url(&self, path: &Path) -> Result<String> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Path is not valid UTF-8: {:?}", path))?;
        Ok(format!(
            "{}://localhost/{}",
            self.scheme,
            urlencoding::encode(path)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_protocol_encodes_path() {
        let url = AssetProtocol::default()
            .asset_url(Path::new("/pics/my cat.jpg"))
            .unwrap();
        assert_eq!(url, "asset://localhost/%2Fpics%2Fmy%20cat.jpg");
    }

    #[tokio::test]
    async fn test_tokio_reader_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.jpg");
        let err = TokioFileReader.read_bytes(&missing).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
