use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CollectionService, Slice, WindowKey, WindowProbe};
use crate::models::{ImageId, ImageRecord};

/// Collection held in memory, in display order.
///
/// Mutations may happen while slices are being fetched.
#[derive(Default)]
pub struct MemoryCollection {
    records: RwLock<Vec<ImageRecord>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
}

impl MemoryCollection {
    pub fn new(records: Vec<ImageRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            ..Default::default()
        }
    }

    pub fn push(&self, record: ImageRecord) {
        self.records.write().push(record);
    }

    /// Inserts `record` at `index`, shifting later records back.
    pub fn insert(&self, index: usize, record: ImageRecord) {
        let mut records = self.records.write();
        let index = index.min(records.len());
        records.insert(index, record);
    }

    pub fn remove(&self, ids: &[ImageId]) -> usize {
        let ids: HashSet<&ImageId> = ids.iter().collect();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of `fetch_slice` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    fn slice(&self, offset: usize, limit: usize) -> Slice {
        let records = self.records.read();
        let start = offset.min(records.len());
        let end = offset.saturating_add(limit).min(records.len());
        Slice {
            records: records[start..end].to_vec(),
            total: records.len(),
        }
    }
}

#[async_trait]
impl CollectionService for MemoryCollection {
    async fn fetch_slice(&self, offset: usize, limit: usize) -> Result<Slice> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.slice(offset, limit))
    }

    async fn probe(&self, key: &WindowKey) -> Result<WindowProbe> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let slice = self.slice(key.offset(), key.limit());
        Ok(WindowProbe {
            total: slice.total,
            entries: slice.records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<ImageRecord> {
        (0..n).map(|i| ImageRecord::new(format!("r{i}"), format!("/img/{i}.jpg"))).collect()
    }

    #[tokio::test]
    async fn test_slice_past_end_is_empty() {
        let collection = MemoryCollection::new(numbered(3));
        let slice = collection.fetch_slice(2, 10).await.unwrap();
        assert_eq!(slice.records.len(), 1);
        assert_eq!(slice.total, 3);
        assert!(collection.fetch_slice(10, 10).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_probe_reports_whole_total() {
        let collection = MemoryCollection::new(numbered(25));
        let probe = collection.probe(&WindowKey::for_leaf(3, 10)).await.unwrap();
        assert_eq!(probe.total, 25);
        assert_eq!(probe.entries.len(), 5);
        assert_eq!(probe.entries[0].id, ImageId::new("r20"));
        assert_eq!(collection.probe_count(), 1);
    }

    #[test]
    fn test_remove_ignores_unknown_ids() {
        let collection = MemoryCollection::new(numbered(3));
        assert_eq!(collection.remove(&[ImageId::new("r1"), ImageId::new("zz")]), 1);
        assert_eq!(collection.len(), 2);
    }
}
