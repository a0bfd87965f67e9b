//! Access to the paginated image collection.
//!
//! This module provides:
//! - `CollectionService` - Slice and window queries against the backing store
//! - `MemoryCollection` / `SqliteCollection` - Concrete services
//! - `PaginationWindow` - The materialized slice the grid displays
//! - `import_directory` - Fills a SQLite collection from a folder

pub mod import;
pub mod memory;
pub mod pagination;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ImageRecord;

pub use import::{discover_images, image_id_for, import_directory, is_supported_image, ImportReport};
pub use memory::MemoryCollection;
pub use pagination::{LoadAllReport, PageWindow, PaginationWindow, RefreshOutcome, WindowMode};
pub use sqlite::SqliteCollection;

/// One fetched slice plus the collection size observed with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slice {
    pub records: Vec<ImageRecord>,
    pub total: usize,
}

/// Result of probing a big-page window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowProbe {
    /// Size of the whole collection.
    pub total: usize,
    pub entries: Vec<ImageRecord>,
}

/// A 1-based inclusive record range, rendered as `"first-last"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub first: usize,
    pub last: usize,
}

impl WindowKey {
    /// Key of leaf `index` (1-based).
    pub fn for_leaf(index: usize, leaf_size: usize) -> Self {
        let leaf_size = leaf_size.max(1);
        let first = index.saturating_sub(1) * leaf_size + 1;
        Self {
            first,
            last: first + leaf_size - 1,
        }
    }

    /// Zero-based offset of the first record.
    pub fn offset(&self) -> usize {
        self.first.saturating_sub(1)
    }

    pub fn limit(&self) -> usize {
        (self.last + 1).saturating_sub(self.first)
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl FromStr for WindowKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (first, last) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("Window key {s:?} is not of the form first-last"))?;
        let first: usize = first.trim().parse()?;
        let last: usize = last.trim().parse()?;
        if first == 0 || last < first {
            anyhow::bail!("Window key {s:?} is not a 1-based ascending range");
        }
        Ok(Self { first, last })
    }
}

/// The external store of image records.
///
/// Reads are consistent within the process but the collection may grow or
/// shrink between any two calls.
#[async_trait]
pub trait CollectionService: Send + Sync {
    async fn fetch_slice(&self, offset: usize, limit: usize) -> Result<Slice>;

    /// Fetches the records of a big-page window together with a fresh total.
    async fn probe(&self, key: &WindowKey) -> Result<WindowProbe> {
        let slice = self.fetch_slice(key.offset(), key.limit()).await?;
        Ok(WindowProbe {
            total: slice.total,
            entries: slice.records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_keys_are_one_based() {
        let key = WindowKey::for_leaf(2, 1000);
        assert_eq!(key.to_string(), "1001-2000");
        assert_eq!(key.offset(), 1000);
        assert_eq!(key.limit(), 1000);
    }

    #[test]
    fn test_parse_window_key() {
        assert_eq!("1-1000".parse::<WindowKey>().unwrap(), WindowKey::for_leaf(1, 1000));
        assert!("0-10".parse::<WindowKey>().is_err());
        assert!("20-10".parse::<WindowKey>().is_err());
        assert!("nope".parse::<WindowKey>().is_err());
    }
}
