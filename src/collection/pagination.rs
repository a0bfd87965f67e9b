//! The materialized slice of the collection shown by the grid.
//!
//! - Flat mode pages from the start of the collection
//! - Leaf mode bounds the window to one fixed-size leaf of a huge collection
//!
//! `total` is re-read on every fetch. A generation counter invalidates
//! fetches that were in flight when the window was reset, jumped or refreshed.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CollectionService, WindowKey};
use crate::config::PaginationConfig;
use crate::error::WindowError;
use crate::models::{ImageId, ImageRecord};
use crate::scheduler::{AbortFlag, Pacer, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    Flat,
    /// 1-based leaf `index` starting at collection offset `base`.
    Leaf { index: usize, base: usize },
}

/// Snapshot of the window bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadAllReport {
    pub slices: usize,
    pub appended: usize,
    pub cancelled: bool,
}

/// Result of re-reading the displayed range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshOutcome {
    pub records: Vec<ImageRecord>,
    /// Previously displayed ids that are gone.
    pub removed: Vec<ImageId>,
}

struct WindowState {
    displayed: Vec<ImageRecord>,
    ids: HashSet<ImageId>,
    mode: WindowMode,
    /// Records reachable in the current window: the collection in flat mode,
    /// the leaf in leaf mode.
    total: usize,
    collection_total: usize,
    /// Window-relative offset of the next fetch. Advances by fetched rows,
    /// not by fresh ones, so a page of already displayed ids still moves it.
    cursor: usize,
    has_more: bool,
    generation: u64,
    jumps: u64,
}

impl WindowState {
    fn base(&self) -> usize {
        match self.mode {
            WindowMode::Flat => 0,
            WindowMode::Leaf { base, .. } => base,
        }
    }

    fn window_total(&self, collection_total: usize, leaf_size: usize) -> usize {
        match self.mode {
            WindowMode::Flat => collection_total,
            WindowMode::Leaf { base, .. } => collection_total.saturating_sub(base).min(leaf_size),
        }
    }

    fn clear(&mut self) {
        self.displayed.clear();
        self.ids.clear();
        self.cursor = 0;
    }

    /// Appends records not yet displayed and returns them.
    fn append_fresh(&mut self, records: Vec<ImageRecord>) -> Vec<ImageRecord> {
        let fresh: Vec<ImageRecord> = records
            .into_iter()
            .filter(|r| self.ids.insert(r.id.clone()))
            .collect();
        self.displayed.extend(fresh.iter().cloned());
        fresh
    }
}

pub struct PaginationWindow {
    service: Arc<dyn CollectionService>,
    config: PaginationConfig,
    pacer: Arc<dyn Pacer>,
    state: Mutex<WindowState>,
    abort: Mutex<AbortFlag>,
}

impl PaginationWindow {
    pub fn new(service: Arc<dyn CollectionService>, config: PaginationConfig, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            service,
            config,
            pacer,
            state: Mutex::new(WindowState {
                displayed: Vec::new(),
                ids: HashSet::new(),
                mode: WindowMode::Flat,
                total: 0,
                collection_total: 0,
                cursor: 0,
                has_more: true,
                generation: 0,
                jumps: 0,
            }),
            abort: Mutex::new(AbortFlag::new()),
        }
    }

    // =========================================================================
    // Read model
    // =========================================================================

    pub fn displayed(&self) -> Vec<ImageRecord> {
        self.state.lock().displayed.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().displayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().displayed.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    pub fn collection_total(&self) -> usize {
        self.state.lock().collection_total
    }

    pub fn mode(&self) -> WindowMode {
        self.state.lock().mode
    }

    pub fn page_window(&self) -> PageWindow {
        let state = self.state.lock();
        PageWindow {
            offset: state.base(),
            limit: state.displayed.len(),
            total: state.total,
        }
    }

    /// Number of leaves the last observed total splits into.
    pub fn leaf_count(&self) -> usize {
        self.state
            .lock()
            .collection_total
            .div_ceil(self.config.leaf_size.max(1))
    }

    pub fn find(&self, id: &ImageId) -> Option<ImageRecord> {
        self.state.lock().displayed.iter().find(|r| &r.id == id).cloned()
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.state.lock().ids.contains(id)
    }

    // =========================================================================
    // Paging
    // =========================================================================

    /// Appends the next page past the fetch cursor and returns the new records.
    ///
    /// `is_initial` restarts the window from its first record. A page made
    /// only of records already displayed (a sync inserted ahead of the tail)
    /// is skipped and the following page fetched in the same call.
    pub async fn load_more(&self, is_initial: bool) -> Result<Vec<ImageRecord>> {
        let page = self.config.page_size.max(1);
        let generation = {
            let mut state = self.state.lock();
            if is_initial {
                state.generation += 1;
            }
            state.generation
        };
        let mut restart = is_initial;

        loop {
            let (offset, limit, cursor) = {
                let state = self.state.lock();
                if state.generation != generation {
                    debug!("Discarding page for a replaced window");
                    return Ok(Vec::new());
                }
                let cursor = if restart { 0 } else { state.cursor };
                let limit = match state.mode {
                    WindowMode::Flat => page,
                    WindowMode::Leaf { .. } => page.min(self.config.leaf_size.saturating_sub(cursor)),
                };
                (state.base() + cursor, limit, cursor)
            };
            if limit == 0 {
                self.state.lock().has_more = false;
                return Ok(Vec::new());
            }

            let slice = self.service.fetch_slice(offset, limit).await?;

            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(offset, "Discarding page fetched for a replaced window");
                return Ok(Vec::new());
            }
            let total = state.window_total(slice.total, self.config.leaf_size);
            let fetched = slice.records.len();
            let cursor = cursor + fetched;
            if fetched == 0 && cursor < total {
                warn!(offset, total, "Empty page before the reported end, stopping pagination");
            }

            // Decided before the list changes so the view never sees a stale flag.
            state.has_more = fetched > 0 && cursor < total;
            state.collection_total = slice.total;
            state.total = total;

            if restart {
                state.clear();
                restart = false;
            }
            state.cursor = cursor;
            let fresh = state.append_fresh(slice.records);
            debug!(
                offset,
                appended = fresh.len(),
                displayed = state.displayed.len(),
                total,
                has_more = state.has_more,
                "Loaded page"
            );
            if !fresh.is_empty() || !state.has_more {
                return Ok(fresh);
            }
            debug!(offset, "Page held only displayed records, fetching the next one");
        }
    }

    /// Streams the rest of the window slice by slice.
    ///
    /// Accumulated records are published through `on_batch` every
    /// `load_all_batch_every` slices, yielding to the pacer in between.
    /// Records fetched but not yet published when the run is cancelled are
    /// dropped.
    pub async fn load_all<F>(&self, mut on_batch: F) -> Result<LoadAllReport>
    where
        F: FnMut(&[ImageRecord]) + Send,
    {
        let abort = AbortFlag::new();
        *self.abort.lock() = abort.clone();

        let slice_size = self.config.load_all_slice.max(1);
        let batch_every = self.config.load_all_batch_every.max(1);
        let (generation, mut cursor) = {
            let state = self.state.lock();
            (state.generation, state.cursor)
        };
        let mut pending: Vec<ImageRecord> = Vec::new();
        let mut pending_ids: HashSet<ImageId> = HashSet::new();
        let mut report = LoadAllReport::default();

        loop {
            if abort.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let (offset, limit) = {
                let state = self.state.lock();
                if state.generation != generation {
                    report.cancelled = true;
                    break;
                }
                let limit = match state.mode {
                    WindowMode::Flat => slice_size,
                    WindowMode::Leaf { .. } => slice_size.min(self.config.leaf_size.saturating_sub(cursor)),
                };
                (state.base() + cursor, limit)
            };
            if limit == 0 {
                self.publish(&mut pending, &mut pending_ids, cursor, &mut report, &mut on_batch);
                break;
            }

            let slice = self.service.fetch_slice(offset, limit).await?;
            if abort.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.slices += 1;

            let done = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    report.cancelled = true;
                    break;
                }
                let total = state.window_total(slice.total, self.config.leaf_size);
                let fetched = slice.records.len();
                for record in slice.records {
                    if !state.ids.contains(&record.id) && pending_ids.insert(record.id.clone()) {
                        pending.push(record);
                    }
                }
                cursor += fetched;
                state.collection_total = slice.total;
                state.total = total;
                fetched == 0 || cursor >= total
            };

            if done || report.slices % batch_every == 0 {
                self.publish(&mut pending, &mut pending_ids, cursor, &mut report, &mut on_batch);
                self.pacer.pause(Priority::Frame).await;
            }
            if done {
                break;
            }
        }

        if report.cancelled {
            info!(slices = report.slices, appended = report.appended, "Load-all cancelled");
        } else {
            info!(slices = report.slices, appended = report.appended, "Load-all complete");
        }
        Ok(report)
    }

    fn publish<F>(
        &self,
        pending: &mut Vec<ImageRecord>,
        pending_ids: &mut HashSet<ImageId>,
        cursor: usize,
        report: &mut LoadAllReport,
        on_batch: &mut F,
    ) where
        F: FnMut(&[ImageRecord]),
    {
        let batch = std::mem::take(pending);
        pending_ids.clear();
        let fresh = {
            let mut state = self.state.lock();
            let fresh = state.append_fresh(batch);
            state.cursor = cursor;
            state.has_more = cursor < state.total;
            fresh
        };
        if !fresh.is_empty() {
            report.appended += fresh.len();
            on_batch(&fresh);
        }
    }

    /// Stops a running `load_all` at its next check.
    pub fn cancel_load_all(&self) {
        self.abort.lock().cancel();
    }

    /// Replaces the window with leaf `index` (1-based).
    ///
    /// Nothing changes until the leaf is validated against a fresh probe.
    /// Returns `None` when a later jump or window change overtook this one.
    pub async fn jump_to_window(&self, index: usize) -> Result<Option<Vec<ImageRecord>>> {
        if index == 0 {
            return Err(WindowError::InvalidLeaf.into());
        }
        let leaf_size = self.config.leaf_size.max(1);
        let key = WindowKey::for_leaf(index, leaf_size);
        let (generation, jump) = {
            let mut state = self.state.lock();
            state.jumps += 1;
            (state.generation, state.jumps)
        };

        let probe = self.service.probe(&key).await?;
        let leaves = probe.total.div_ceil(leaf_size);
        if index > leaves.max(1) {
            return Err(WindowError::OutOfRange { index, leaves }.into());
        }

        let displayed = {
            let mut state = self.state.lock();
            if state.generation != generation || state.jumps != jump {
                debug!(%key, "Discarding superseded window jump");
                return Ok(None);
            }
            state.generation += 1;
            state.mode = WindowMode::Leaf {
                index,
                base: key.offset(),
            };
            state.collection_total = probe.total;
            state.total = state.window_total(probe.total, leaf_size);
            state.clear();
            let mut entries = probe.entries;
            entries.truncate(leaf_size);
            state.cursor = entries.len();
            state.append_fresh(entries);
            state.has_more = state.cursor < state.total;
            info!(%key, displayed = state.displayed.len(), total = probe.total, "Jumped to window");
            state.displayed.clone()
        };
        self.cancel_load_all();
        Ok(Some(displayed))
    }

    /// Leaves leaf mode and empties the window.
    pub fn reset(&self) {
        self.cancel_load_all();
        let mut state = self.state.lock();
        state.generation += 1;
        state.mode = WindowMode::Flat;
        state.clear();
        state.total = 0;
        state.collection_total = 0;
        state.has_more = true;
    }

    /// Re-reads the displayed range of the current window.
    ///
    /// With `preserve_length` the refreshed window keeps at least as many
    /// records as were displayed; otherwise it shrinks back to one page.
    /// Returns `None` if another window change overtook the refresh.
    pub async fn refresh(&self, preserve_length: bool) -> Result<Option<RefreshOutcome>> {
        self.cancel_load_all();
        let page = self.config.page_size.max(1);
        let (offset, limit, generation) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let mut limit = if preserve_length {
                state.displayed.len().max(page)
            } else {
                page
            };
            if let WindowMode::Leaf { .. } = state.mode {
                limit = limit.min(self.config.leaf_size.max(1));
            }
            (state.base(), limit, state.generation)
        };

        let slice = self.service.fetch_slice(offset, limit).await?;

        let mut state = self.state.lock();
        if state.generation != generation {
            return Ok(None);
        }
        let previous = std::mem::take(&mut state.displayed);
        state.ids.clear();
        state.cursor = slice.records.len();
        let records = state.append_fresh(slice.records);
        let removed = previous
            .into_iter()
            .filter(|r| !state.ids.contains(&r.id))
            .map(|r| r.id)
            .collect::<Vec<_>>();
        state.collection_total = slice.total;
        state.total = state.window_total(slice.total, self.config.leaf_size);
        state.has_more = state.cursor < state.total;
        debug!(
            displayed = state.displayed.len(),
            removed = removed.len(),
            total = state.total,
            "Refreshed window"
        );
        Ok(Some(RefreshOutcome { records, removed }))
    }

    /// Drops `ids` from the displayed list. Returns how many were displayed.
    pub fn remove_ids(&self, ids: &HashSet<ImageId>) -> usize {
        let mut state = self.state.lock();
        let before = state.displayed.len();
        state.displayed.retain(|r| !ids.contains(&r.id));
        let removed = before - state.displayed.len();
        if removed > 0 {
            for id in ids {
                state.ids.remove(id);
            }
            // Removed rows sat before the cursor, so later rows shift back.
            state.cursor = state.cursor.saturating_sub(removed);
            state.total = state.total.saturating_sub(removed);
            state.collection_total = state.collection_total.saturating_sub(removed);
            state.has_more = state.cursor < state.total;
        }
        removed
    }
}
