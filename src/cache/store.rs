//! Handle cache keyed by record id.
//!
//! - Entries: LRU of `CacheEntry` bounded by entry count and retained bytes
//! - Retention set: every owned buffer handed out, keyed by its blob reference
//! - Load states: per (id, kind) state machine with dispatch tickets
//!
//! The store is the only caller of `BlobRegistry::revoke`. A reference leaves
//! the retention set exactly when it is revoked, which makes release idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::handle::{BlobRegistry, CacheEntry, Handle, ImageBuffer};
use super::state::{LoadState, Ticket};
use crate::config::CacheConfig;
use crate::error::FailureKind;
use crate::models::{ImageId, ImageKind};

/// Outcome of asking to dispatch an (id, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started(Ticket),
    /// Another dispatch already owns the slot.
    Coalesced,
    AlreadyLoaded,
    /// Retry budget exhausted earlier in this session.
    Failed,
    /// The store was reset after the caller captured its epoch.
    Superseded,
}

struct StoreInner {
    entries: LruCache<ImageId, CacheEntry>,
    retained: HashMap<String, Arc<ImageBuffer>>,
    retained_bytes: usize,
    states: HashMap<(ImageId, ImageKind), LoadState>,
    epoch: u64,
    seq: u64,
}

impl StoreInner {
    fn next_ticket(&mut self) -> Ticket {
        self.seq += 1;
        Ticket {
            epoch: self.epoch,
            seq: self.seq,
        }
    }

    fn is_current(&self, id: &ImageId, kind: ImageKind, ticket: Ticket) -> bool {
        ticket.epoch == self.epoch
            && self
                .states
                .get(&(id.clone(), kind))
                .and_then(LoadState::ticket)
                == Some(ticket)
    }

    fn forget_states(&mut self, id: &ImageId) {
        for kind in ImageKind::ALL {
            self.states.remove(&(id.clone(), kind));
        }
    }
}

/// Cache of resolved handles with explicit release.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    registry: Arc<dyn BlobRegistry>,
    max_memory_bytes: usize,
    max_entries: usize,
    revision: watch::Sender<u64>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig, registry: Arc<dyn BlobRegistry>) -> Self {
        let (revision, _) = watch::channel(0);
        let max_memory_bytes = config.max_memory_bytes();
        debug!(
            max_memory_bytes,
            max_entries = config.max_entries,
            "Initialized handle cache"
        );
        Self {
            inner: Mutex::new(StoreInner {
                entries: LruCache::unbounded(),
                retained: HashMap::new(),
                retained_bytes: 0,
                states: HashMap::new(),
                epoch: 0,
                seq: 0,
            }),
            registry,
            max_memory_bytes,
            max_entries: config.max_entries.max(1),
            revision,
        }
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Publishes `buffer` and adds it to the retention set.
    pub fn retain_buffer(&self, buffer: ImageBuffer) -> Handle {
        let buffer = Arc::new(buffer);
        let url = self.registry.create(&buffer);
        let mut inner = self.inner.lock();
        inner.retained_bytes += buffer.len();
        inner.retained.insert(url.clone(), Arc::clone(&buffer));
        Handle::Buffer { url, buffer }
    }

    /// Releases a handle that never made it into an entry.
    pub fn discard(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        self.release_locked(&mut inner, &handle);
    }

    fn release_locked(&self, inner: &mut StoreInner, handle: &Handle) {
        let Handle::Buffer { url, .. } = handle else {
            return;
        };
        if let Some(buffer) = inner.retained.remove(url) {
            inner.retained_bytes = inner.retained_bytes.saturating_sub(buffer.len());
            self.registry.revoke(url);
            trace!(%url, "Released buffer");
        }
    }

    // =========================================================================
    // Entries
    // =========================================================================

    pub fn get(&self, id: &ImageId) -> Option<CacheEntry> {
        self.inner.lock().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.inner.lock().entries.contains(id)
    }

    /// Stores `handle` in the `kind` slot, leaving the other slot untouched.
    pub fn set(&self, id: &ImageId, kind: ImageKind, handle: Handle) {
        let mut inner = self.inner.lock();
        self.set_locked(&mut inner, id, kind, handle);
        inner.states.insert((id.clone(), kind), LoadState::Loaded);
        self.enforce_budget(&mut inner, id);
        drop(inner);
        self.bump();
    }

    fn set_locked(&self, inner: &mut StoreInner, id: &ImageId, kind: ImageKind, handle: Handle) {
        let new_url = handle.url().to_owned();
        let entry = inner.entries.get_or_insert_mut(id.clone(), CacheEntry::default);
        let previous = entry.slot_mut(kind).replace(handle);
        if let Some(old) = previous {
            if old.url() != new_url {
                self.release_locked(inner, &old);
            }
        }
    }

    /// Removes entries and all bookkeeping for `ids`. Unknown ids are ignored.
    pub fn remove<'a, I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a ImageId>,
    {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for id in ids {
            let popped = inner.entries.pop(id);
            if let Some(entry) = popped {
                for handle in entry.into_handles() {
                    self.release_locked(&mut inner, &handle);
                }
                removed += 1;
            }
            inner.forget_states(id);
        }
        drop(inner);
        if removed > 0 {
            debug!(removed, "Removed cache entries");
        }
        self.bump();
        removed
    }

    /// Releases everything and starts a new epoch.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let ids: Vec<ImageId> = inner.entries.iter().map(|(id, _)| id.clone()).collect();
        for id in &ids {
            let popped = inner.entries.pop(id);
            if let Some(entry) = popped {
                for handle in entry.into_handles() {
                    self.release_locked(&mut inner, &handle);
                }
            }
        }
        // Buffers still travelling with stale dispatches.
        let stray: Vec<String> = inner.retained.keys().cloned().collect();
        for url in stray {
            inner.retained.remove(&url);
            self.registry.revoke(&url);
        }
        inner.retained_bytes = 0;
        inner.states.clear();
        inner.epoch += 1;
        let epoch = inner.epoch;
        drop(inner);
        debug!(epoch, entries = ids.len(), "Reset handle cache");
        self.bump();
    }

    /// Evicts least recently used entries until within budget, sparing `keep`.
    fn enforce_budget(&self, inner: &mut StoreInner, keep: &ImageId) {
        while inner.retained_bytes > self.max_memory_bytes || inner.entries.len() > self.max_entries
        {
            let Some((lru_id, _)) = inner.entries.peek_lru() else {
                break;
            };
            if lru_id == keep {
                if inner.entries.len() == 1 {
                    break;
                }
                inner.entries.promote(keep);
                continue;
            }
            let Some((id, entry)) = inner.entries.pop_lru() else {
                break;
            };
            let freed: usize = entry
                .thumbnail
                .iter()
                .chain(&entry.original)
                .map(Handle::memory_bytes)
                .sum();
            for handle in entry.into_handles() {
                self.release_locked(inner, &handle);
            }
            inner.forget_states(&id);
            trace!(
                %id,
                evicted_bytes = freed,
                current_bytes = inner.retained_bytes,
                "Evicted entry from handle cache"
            );
        }
    }

    // =========================================================================
    // Load states
    // =========================================================================

    pub fn state(&self, id: &ImageId, kind: ImageKind) -> LoadState {
        self.inner
            .lock()
            .states
            .get(&(id.clone(), kind))
            .copied()
            .unwrap_or_default()
    }

    /// Claims the (id, kind) slot for a new dispatch.
    pub fn begin(&self, id: &ImageId, kind: ImageKind) -> Begin {
        let mut inner = self.inner.lock();
        Self::begin_locked(&mut inner, id, kind)
    }

    /// Like `begin`, but only while the store is still in `epoch`.
    pub fn begin_at(&self, id: &ImageId, kind: ImageKind, epoch: u64) -> Begin {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Begin::Superseded;
        }
        Self::begin_locked(&mut inner, id, kind)
    }

    fn begin_locked(inner: &mut StoreInner, id: &ImageId, kind: ImageKind) -> Begin {
        let key = (id.clone(), kind);
        match inner.states.get(&key).copied().unwrap_or_default() {
            LoadState::InFlight { .. } | LoadState::Backoff { .. } => Begin::Coalesced,
            LoadState::Failed { .. } => Begin::Failed,
            LoadState::Loaded
                if inner
                    .entries
                    .peek(id)
                    .is_some_and(|e| e.get(kind).is_some()) =>
            {
                Begin::AlreadyLoaded
            }
            _ => {
                let ticket = inner.next_ticket();
                inner
                    .states
                    .insert(key, LoadState::InFlight { ticket, attempt: 1 });
                Begin::Started(ticket)
            }
        }
    }

    /// Claims the slot unconditionally; any earlier dispatch becomes stale.
    pub fn restart(&self, id: &ImageId, kind: ImageKind) -> Ticket {
        let mut inner = self.inner.lock();
        let ticket = inner.next_ticket();
        inner
            .states
            .insert((id.clone(), kind), LoadState::InFlight { ticket, attempt: 1 });
        ticket
    }

    pub fn is_current(&self, id: &ImageId, kind: ImageKind, ticket: Ticket) -> bool {
        self.inner.lock().is_current(id, kind, ticket)
    }

    /// Marks attempt `attempt` as running. False if the dispatch is stale.
    pub fn mark_attempt(&self, id: &ImageId, kind: ImageKind, ticket: Ticket, attempt: u32) -> bool {
        self.transition(id, kind, ticket, LoadState::InFlight { ticket, attempt })
    }

    /// Marks the dispatch as waiting on its retry timer.
    pub fn mark_backoff(&self, id: &ImageId, kind: ImageKind, ticket: Ticket, attempt: u32) -> bool {
        self.transition(id, kind, ticket, LoadState::Backoff { ticket, attempt })
    }

    /// Records exhaustion of the retry budget.
    pub fn mark_failed(
        &self,
        id: &ImageId,
        kind: ImageKind,
        ticket: Ticket,
        attempts: u32,
        reason: FailureKind,
    ) -> bool {
        let changed = self.transition(id, kind, ticket, LoadState::Failed { attempts, reason });
        if changed {
            self.bump();
        }
        changed
    }

    fn transition(&self, id: &ImageId, kind: ImageKind, ticket: Ticket, next: LoadState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_current(id, kind, ticket) {
            return false;
        }
        inner.states.insert((id.clone(), kind), next);
        true
    }

    /// Stores the result of a dispatch if it is still current; otherwise the
    /// handle is released and false is returned.
    pub fn commit(&self, id: &ImageId, kind: ImageKind, ticket: Ticket, handle: Handle) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_current(id, kind, ticket) {
            self.release_locked(&mut inner, &handle);
            trace!(%id, %kind, "Discarded stale result");
            return false;
        }
        self.set_locked(&mut inner, id, kind, handle);
        inner.states.insert((id.clone(), kind), LoadState::Loaded);
        self.enforce_budget(&mut inner, id);
        drop(inner);
        self.bump();
        true
    }

    /// Clears `Failed` states for `id` so it can be dispatched again.
    pub fn clear_failures(&self, id: &ImageId) -> Vec<ImageKind> {
        let mut inner = self.inner.lock();
        let mut cleared = Vec::new();
        for kind in ImageKind::ALL {
            let key = (id.clone(), kind);
            if inner.states.get(&key).is_some_and(LoadState::is_failed) {
                inner.states.remove(&key);
                cleared.push(kind);
            }
        }
        cleared
    }

    /// Ids that currently have a pending dispatch for any kind.
    pub fn pending_ids(&self) -> HashSet<ImageId> {
        self.inner
            .lock()
            .states
            .iter()
            .filter(|(_, s)| s.is_pending())
            .map(|((id, _), _)| id.clone())
            .collect()
    }

    // =========================================================================
    // Read model
    // =========================================================================

    /// Copy of every entry, for the view layer.
    pub fn snapshot(&self) -> HashMap<ImageId, CacheEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Revision counter bumped on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Bytes held by retained buffers.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().retained_bytes
    }

    pub fn retained_count(&self) -> usize {
        self.inner.lock().retained.len()
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{buffer_of, RecordingRegistry};

    fn store_with(registry: &Arc<RecordingRegistry>) -> CacheStore {
        CacheStore::new(&CacheConfig::default(), Arc::clone(registry) as Arc<dyn BlobRegistry>)
    }

    fn id(s: &str) -> ImageId {
        ImageId::new(s)
    }

    #[test]
    fn test_set_is_additive_per_kind() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let thumb = store.retain_buffer(buffer_of(16));
        let original = store.retain_buffer(buffer_of(64));
        store.set(&id("a"), ImageKind::Original, original.clone());
        store.set(&id("a"), ImageKind::Thumbnail, thumb.clone());

        let entry = store.get(&id("a")).unwrap();
        assert_eq!(entry.thumbnail.as_ref().map(Handle::url), Some(thumb.url()));
        assert_eq!(entry.original.as_ref().map(Handle::url), Some(original.url()));
        assert_eq!(registry.revoked_count(), 0);
    }

    #[test]
    fn test_replacing_a_slot_releases_old_buffer() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let first = store.retain_buffer(buffer_of(16));
        let second = store.retain_buffer(buffer_of(16));
        store.set(&id("a"), ImageKind::Thumbnail, first.clone());
        store.set(&id("a"), ImageKind::Thumbnail, second);

        assert_eq!(registry.revocations(first.url()), 1);
        assert_eq!(store.retained_count(), 1);
    }

    #[test]
    fn test_remove_releases_exactly_once() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let handle = store.retain_buffer(buffer_of(32));
        store.set(&id("a"), ImageKind::Thumbnail, handle.clone());

        assert_eq!(store.remove([&id("a")]), 1);
        assert_eq!(store.remove([&id("a"), &id("never-seen")]), 0);
        store.discard(handle.clone());
        store.reset();

        assert!(store.get(&id("a")).is_none());
        assert_eq!(registry.revocations(handle.url()), 1);
        assert_eq!(store.memory_usage(), 0);
        assert_eq!(store.state(&id("a"), ImageKind::Thumbnail), LoadState::Absent);
    }

    #[test]
    fn test_begin_coalesces_pending_dispatch() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let Begin::Started(ticket) = store.begin(&id("a"), ImageKind::Thumbnail) else {
            panic!("first begin should start");
        };
        assert_eq!(store.begin(&id("a"), ImageKind::Thumbnail), Begin::Coalesced);
        assert!(store.mark_backoff(&id("a"), ImageKind::Thumbnail, ticket, 1));
        assert_eq!(store.begin(&id("a"), ImageKind::Thumbnail), Begin::Coalesced);
        // Other kind is independent.
        assert!(matches!(store.begin(&id("a"), ImageKind::Original), Begin::Started(_)));
    }

    #[test]
    fn test_begin_at_rejects_old_epoch() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);
        let epoch = store.epoch();
        store.reset();
        assert_eq!(store.begin_at(&id("a"), ImageKind::Thumbnail, epoch), Begin::Superseded);
        assert!(matches!(
            store.begin_at(&id("a"), ImageKind::Thumbnail, store.epoch()),
            Begin::Started(_)
        ));
    }

    #[test]
    fn test_commit_after_remove_is_discarded() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let Begin::Started(ticket) = store.begin(&id("a"), ImageKind::Thumbnail) else {
            panic!("begin should start");
        };
        store.remove([&id("a")]);

        let handle = store.retain_buffer(buffer_of(8));
        assert!(!store.commit(&id("a"), ImageKind::Thumbnail, ticket, handle.clone()));
        assert!(store.get(&id("a")).is_none());
        assert_eq!(registry.revocations(handle.url()), 1);
    }

    #[test]
    fn test_reset_invalidates_tickets_and_strays() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let Begin::Started(ticket) = store.begin(&id("a"), ImageKind::Thumbnail) else {
            panic!("begin should start");
        };
        let in_transit = store.retain_buffer(buffer_of(8));
        let epoch = store.epoch();
        store.reset();

        assert_eq!(store.epoch(), epoch + 1);
        assert!(!store.is_current(&id("a"), ImageKind::Thumbnail, ticket));
        assert_eq!(registry.revocations(in_transit.url()), 1);
        assert!(!store.commit(&id("a"), ImageKind::Thumbnail, ticket, in_transit.clone()));
        assert_eq!(registry.revocations(in_transit.url()), 1);
    }

    #[test]
    fn test_failed_state_sticks_until_cleared() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);

        let Begin::Started(ticket) = store.begin(&id("a"), ImageKind::Thumbnail) else {
            panic!("begin should start");
        };
        assert!(store.mark_failed(&id("a"), ImageKind::Thumbnail, ticket, 4, FailureKind::IoFailure));
        assert_eq!(store.begin(&id("a"), ImageKind::Thumbnail), Begin::Failed);

        assert_eq!(store.clear_failures(&id("a")), vec![ImageKind::Thumbnail]);
        assert!(matches!(store.begin(&id("a"), ImageKind::Thumbnail), Begin::Started(_)));
    }

    #[test]
    fn test_entry_budget_evicts_lru() {
        let registry = Arc::new(RecordingRegistry::default());
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let store = CacheStore::new(&config, Arc::clone(&registry) as Arc<dyn BlobRegistry>);

        let a = store.retain_buffer(buffer_of(4));
        store.set(&id("a"), ImageKind::Thumbnail, a.clone());
        store.set(&id("b"), ImageKind::Thumbnail, store.retain_buffer(buffer_of(4)));
        // Touch "a" so "b" becomes least recently used.
        assert!(store.get(&id("a")).is_some());
        store.set(&id("c"), ImageKind::Thumbnail, store.retain_buffer(buffer_of(4)));

        assert_eq!(store.len(), 2);
        assert!(store.contains(&id("a")));
        assert!(!store.contains(&id("b")));
        assert_eq!(store.state(&id("b"), ImageKind::Thumbnail), LoadState::Absent);
        assert_eq!(registry.revoked_count(), 1);
    }

    #[test]
    fn test_subscribers_see_revisions() {
        let registry = Arc::new(RecordingRegistry::default());
        let store = store_with(&registry);
        let rx = store.subscribe();
        let before = *rx.borrow();
        store.set(&id("a"), ImageKind::Thumbnail, Handle::Asset { url: "asset://a".into() });
        assert!(*rx.borrow() > before);
        assert_eq!(store.snapshot().len(), 1);
    }
}
