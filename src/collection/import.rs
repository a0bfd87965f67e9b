//! Directory import into a SQLite collection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tokio::task;
use tracing::{info, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use super::SqliteCollection;
use crate::models::{ImageId, ImageRecord};

static IMAGE_EXTENSIONS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["jpg", "jpeg", "png", "gif", "webp", "bmp"].into_iter().collect());

const INSERT_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub discovered: usize,
    pub inserted: usize,
    /// Entries that could not be read while walking.
    pub errors: usize,
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
}

/// Stable id for a file path.
pub fn image_id_for(path: &Path) -> ImageId {
    ImageId::from(format!("{:016x}", xxh3_64(path.as_os_str().as_encoded_bytes())))
}

/// Walks `dir` recursively and returns a record per supported image, sorted by path.
pub fn discover_images(dir: &Path) -> Result<(Vec<ImageRecord>, usize)> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {:?}", dir);
    }

    let mut records = Vec::new();
    let mut errors = 0;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_supported_image(entry.path()) {
            continue;
        }
        if entry.path().to_str().is_none() {
            warn!("Skipping non-UTF-8 path: {:?}", entry.path());
            errors += 1;
            continue;
        }

        let crawled_at = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let path = entry.path().to_path_buf();
        records.push(ImageRecord::new(image_id_for(&path), path).with_crawled_at(crawled_at));
    }

    records.sort_by(|a, b| a.local_path.cmp(&b.local_path));
    Ok((records, errors))
}

/// Imports every supported image under `dir` into `collection`.
pub async fn import_directory(dir: &Path, collection: &SqliteCollection) -> Result<ImportReport> {
    let dir: PathBuf = dir.to_path_buf();
    let collection = collection.clone();

    let report = task::spawn_blocking(move || -> Result<ImportReport> {
        let (records, errors) = discover_images(&dir)?;
        let mut inserted = 0;
        for batch in records.chunks(INSERT_BATCH) {
            inserted += collection.insert_batch(batch)?;
        }
        Ok(ImportReport {
            discovered: records.len(),
            inserted,
            errors,
        })
    })
    .await
    .context("Import task panicked")??;

    info!(
        "Import complete: {} discovered, {} inserted, {} errors",
        report.discovered, report.inserted, report.errors
    );
    Ok(report)
}
