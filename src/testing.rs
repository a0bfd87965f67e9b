//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::cache::{BlobRegistry, ImageBuffer, LocalBlobRegistry};
use crate::resolver::FileReader;

/// Encodes a blank image of the given size.
pub(crate) fn encode_image(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .expect("encode test image");
    bytes
}

/// A JPEG-signed buffer of `len` bytes.
pub(crate) fn buffer_of(len: usize) -> ImageBuffer {
    let mut bytes = vec![0xFF, 0xD8, 0xFF];
    bytes.resize(len.max(3), 0);
    ImageBuffer::new(bytes, ImageFormat::Jpeg)
}

/// Scripted behavior for one path.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Bytes(Vec<u8>),
    Fail(std::io::ErrorKind),
    /// Never completes.
    Hang,
    Delay(Duration, Vec<u8>),
    /// Fails the first `failures` reads, then serves `bytes`.
    FailThen { failures: usize, bytes: Vec<u8> },
}

/// In-memory `FileReader` with per-path read accounting.
#[derive(Default)]
pub(crate) struct MemoryFiles {
    scripts: Mutex<HashMap<PathBuf, Script>>,
    reads: Mutex<Vec<(PathBuf, Instant)>>,
}

impl MemoryFiles {
    pub(crate) fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.script(path, Script::Bytes(bytes));
    }

    pub(crate) fn script(&self, path: impl Into<PathBuf>, script: Script) {
        self.scripts.lock().insert(path.into(), script);
    }

    pub(crate) fn reads(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        self.reads.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub(crate) fn total_reads(&self) -> usize {
        self.reads.lock().len()
    }

    /// Paths in the order reads started.
    pub(crate) fn read_order(&self) -> Vec<PathBuf> {
        self.reads.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub(crate) fn read_instants(&self, path: impl AsRef<Path>) -> Vec<Instant> {
        let path = path.as_ref();
        self.reads
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl FileReader for MemoryFiles {
    async fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let prior = self.reads(path);
        self.reads.lock().push((path.to_path_buf(), Instant::now()));
        let script = self.scripts.lock().get(path).cloned();
        match script {
            None => Err(std::io::ErrorKind::NotFound.into()),
            Some(Script::Bytes(bytes)) => Ok(bytes),
            Some(Script::Fail(kind)) => Err(kind.into()),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Delay(delay, bytes)) => {
                tokio::time::sleep(delay).await;
                Ok(bytes)
            }
            Some(Script::FailThen { failures, bytes }) => {
                if prior < failures {
                    Err(std::io::ErrorKind::Other.into())
                } else {
                    Ok(bytes)
                }
            }
        }
    }

    async fn len(&self, path: &Path) -> std::io::Result<u64> {
        let script = self.scripts.lock().get(path).cloned();
        match script {
            None => Err(std::io::ErrorKind::NotFound.into()),
            Some(Script::Bytes(bytes)) | Some(Script::Delay(_, bytes)) => Ok(bytes.len() as u64),
            Some(Script::FailThen { bytes, .. }) => Ok(bytes.len() as u64),
            Some(Script::Fail(kind)) => Err(kind.into()),
            Some(Script::Hang) => Ok(1),
        }
    }
}

/// Blob registry that counts revocations per reference.
#[derive(Default)]
pub(crate) struct RecordingRegistry {
    inner: LocalBlobRegistry,
    revoked: Mutex<HashMap<String, usize>>,
}

impl RecordingRegistry {
    pub(crate) fn revocations(&self, url: &str) -> usize {
        self.revoked.lock().get(url).copied().unwrap_or(0)
    }

    pub(crate) fn revoked_count(&self) -> usize {
        self.revoked.lock().values().sum()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.inner.live_count()
    }
}

impl BlobRegistry for RecordingRegistry {
    fn create(&self, buffer: &Arc<ImageBuffer>) -> String {
        self.inner.create(buffer)
    }

    fn revoke(&self, url: &str) -> bool {
        *self.revoked.lock().entry(url.to_string()).or_default() += 1;
        self.inner.revoke(url)
    }
}
