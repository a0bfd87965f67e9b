//! The image grid engine.
//!
//! `GalleryEngine` owns the handle cache, the pagination window and the
//! dispatch machinery, and exposes the operations the presentation layer
//! calls. It is cheap to clone; clones share one engine.
//!
//! A load pass runs in two phases:
//! 1. Records inside the viewport estimate go through a bounded pool
//! 2. The remainder is dispatched in paced chunks once phase 1 finished
//!
//! Background chunks stop as soon as the cache epoch changes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{BlobRegistry, CacheEntry, CacheStore, LoadState, LocalBlobRegistry};
use crate::collection::{CollectionService, LoadAllReport, PaginationWindow, RefreshOutcome};
use crate::config::EngineConfig;
use crate::invalidation::{BridgeHandle, ChangeEvent, EventFilter, InvalidationBridge, InvalidationSink};
use crate::layout::{GridLayout, RenderedItem, ViewportEstimate, ViewportEstimator, ViewportMetrics};
use crate::models::{ImageId, ImageKind, ImageRecord};
use crate::resolver::{AssetMapper, AssetProtocol, FileReader, PathResolver, TokioFileReader};
use crate::scheduler::{ConcurrencyPool, Dispatch, InteractionFlag, Pacer, Priority, RetryScheduler, TokioPacer};


/// Counts of one load pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub visible: usize,
    pub background: usize,
    pub loaded: usize,
    pub failed: usize,
    /// Skipped because the user was interacting.
    pub deferred: bool,
    /// Background chunks stopped after a reset.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Keep at least as many records as are displayed now.
    pub preserve_length: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self { preserve_length: true }
    }
}

#[derive(Default)]
struct Tally {
    loaded: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: Dispatch) {
        match outcome {
            Dispatch::Loaded { .. } | Dispatch::AlreadyLoaded => {
                self.loaded.fetch_add(1, Ordering::Relaxed);
            }
            Dispatch::Failed { .. } | Dispatch::PreviouslyFailed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Dispatch::Coalesced | Dispatch::Stale => {}
        }
    }
}

async fn dispatch_record(
    scheduler: Arc<RetryScheduler>,
    tally: Arc<Tally>,
    record: ImageRecord,
    epoch: u64,
    with_original: bool,
) -> Result<()> {
    tally.record(scheduler.load_at(&record, ImageKind::Thumbnail, epoch).await);
    if with_original {
        tally.record(scheduler.load_at(&record, ImageKind::Original, epoch).await);
    }
    Ok(())
}

#[derive(Default)]
struct ViewportState {
    metrics: Option<ViewportMetrics>,
    columns: Option<usize>,
    rendered: Vec<RenderedItem>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<CacheStore>,
    scheduler: Arc<RetryScheduler>,
    window: PaginationWindow,
    estimator: ViewportEstimator,
    pacer: Arc<dyn Pacer>,
    interaction: InteractionFlag,
    viewport: Mutex<ViewportState>,
    passes: Mutex<Vec<JoinHandle<LoadReport>>>,
    bridge: Mutex<Option<BridgeHandle>>,
}

pub struct EngineBuilder {
    collection: Arc<dyn CollectionService>,
    config: EngineConfig,
    reader: Option<Arc<dyn FileReader>>,
    registry: Option<Arc<dyn BlobRegistry>>,
    assets: Option<Arc<dyn AssetMapper>>,
    pacer: Option<Arc<dyn Pacer>>,
    interaction: Option<InteractionFlag>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn file_reader(mut self, reader: Arc<dyn FileReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn blob_registry(mut self, registry: Arc<dyn BlobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Used when `prefer_asset_urls` is set. Defaults to `AssetProtocol`.
    pub fn asset_mapper(mut self, mapper: Arc<dyn AssetMapper>) -> Self {
        self.assets = Some(mapper);
        self
    }

    pub fn pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// Shares an interaction flag with other views.
    pub fn interaction(mut self, flag: InteractionFlag) -> Self {
        self.interaction = Some(flag);
        self
    }

    pub fn build(self) -> GalleryEngine {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(LocalBlobRegistry::new()));
        let store = Arc::new(CacheStore::new(&config.cache, registry));

        let reader = self.reader.unwrap_or_else(|| Arc::new(TokioFileReader));
        let mut resolver = PathResolver::new(reader, Arc::clone(&store));
        if config.prefer_asset_urls {
            let mapper = self
                .assets
                .unwrap_or_else(|| Arc::new(AssetProtocol::default()));
            resolver = resolver.with_assets(mapper, true);
        }
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::new(resolver),
            Arc::clone(&store),
            config.retry.clone(),
        ));

        let pacer = self
            .pacer
            .unwrap_or_else(|| Arc::new(TokioPacer::new(Duration::from_millis(config.pool.idle_slice_ms))));
        let window = PaginationWindow::new(self.collection, config.pagination.clone(), Arc::clone(&pacer));

        GalleryEngine {
            inner: Arc::new(EngineInner {
                estimator: ViewportEstimator::from_config(&config.viewport),
                config,
                store,
                scheduler,
                window,
                pacer,
                interaction: self.interaction.unwrap_or_default(),
                viewport: Mutex::new(ViewportState::default()),
                passes: Mutex::new(Vec::new()),
                bridge: Mutex::new(None),
            }),
        }
    }
}

#[derive(Clone)]
pub struct GalleryEngine {
    inner: Arc<EngineInner>,
}

impl GalleryEngine {
    pub fn builder(collection: Arc<dyn CollectionService>) -> EngineBuilder {
        EngineBuilder {
            collection,
            config: EngineConfig::default(),
            reader: None,
            registry: None,
            assets: None,
            pacer: None,
            interaction: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn window(&self) -> &PaginationWindow {
        &self.inner.window
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads the first page and starts resolving it.
    pub async fn init(&self) -> Result<()> {
        let first = self.load_more(true).await?;
        info!(records = first.len(), total = self.inner.window.total(), "Gallery engine ready");
        Ok(())
    }

    /// Drops the window and every cached handle.
    pub fn reset(&self) {
        self.abort_passes();
        self.inner.window.reset();
        self.inner.store.reset();
        debug!("Gallery engine reset");
    }

    /// Tears the engine down. It can be started again with `init`.
    pub fn dispose(&self) {
        if let Some(bridge) = self.inner.bridge.lock().take() {
            bridge.stop();
        }
        self.reset();
        info!("Gallery engine disposed");
    }

    /// Waits for every spawned load pass to finish.
    pub async fn settle(&self) {
        loop {
            let passes = std::mem::take(&mut *self.inner.passes.lock());
            if passes.is_empty() {
                break;
            }
            for pass in passes {
                if let Err(e) = pass.await {
                    if !e.is_cancelled() {
                        warn!(error = ?e, "Load pass panicked");
                    }
                }
            }
        }
    }

    fn spawn_pass(&self, records: Vec<ImageRecord>) {
        if records.is_empty() {
            return;
        }
        let engine = self.clone();
        let epoch = self.inner.store.epoch();
        let pass = tokio::spawn(async move { engine.run_pass(Some(records), epoch).await });
        let mut passes = self.inner.passes.lock();
        passes.retain(|p| !p.is_finished());
        passes.push(pass);
    }

    fn abort_passes(&self) {
        for pass in self.inner.passes.lock().drain(..) {
            pass.abort();
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Resolves thumbnails for `targets`, or for the displayed window.
    ///
    /// Passes without explicit targets are skipped while the user interacts;
    /// explicit passes run with reduced concurrency instead.
    pub async fn load_image_urls(&self, targets: Option<Vec<ImageRecord>>) -> LoadReport {
        self.run_pass(targets, self.inner.store.epoch()).await
    }

    /// A pass pinned to the cache epoch it was issued in.
    async fn run_pass(&self, targets: Option<Vec<ImageRecord>>, epoch: u64) -> LoadReport {
        let inner = &self.inner;
        let explicit = targets.is_some();
        let interacting = inner.interaction.is_active();
        if !explicit && interacting {
            debug!("Deferring viewport pass while interacting");
            return LoadReport {
                deferred: true,
                ..Default::default()
            };
        }

        let records = targets.unwrap_or_else(|| inner.window.displayed());
        let visible_ids: HashSet<ImageId> = self.viewport_estimate().visible_ids.into_iter().collect();
        let absent = |r: &ImageRecord, kind| inner.store.state(&r.id, kind) == LoadState::Absent;
        let mut seen = HashSet::new();
        // A visible record with a cached thumbnail still needs its original when preloading.
        let pending: Vec<ImageRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .filter(|r| {
                absent(r, ImageKind::Thumbnail)
                    || (inner.config.preload_originals
                        && visible_ids.contains(&r.id)
                        && absent(r, ImageKind::Original))
            })
            .collect();
        if pending.is_empty() {
            return LoadReport::default();
        }

        let (visible, background): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|r| visible_ids.contains(&r.id));
        let mut report = LoadReport {
            visible: visible.len(),
            background: background.len(),
            ..Default::default()
        };

        let pool = &inner.config.pool;
        if inner.store.epoch() != epoch {
            report.cancelled = true;
            return report;
        }
        let tally = Arc::new(Tally::default());

        if !visible.is_empty() {
            let lanes = if interacting {
                pool.interacting_concurrency
            } else {
                pool.visible_concurrency
            };
            let scheduler = Arc::clone(&inner.scheduler);
            let worker_tally = Arc::clone(&tally);
            let with_original = inner.config.preload_originals;
            ConcurrencyPool::run(visible, lanes, move |record| {
                dispatch_record(Arc::clone(&scheduler), Arc::clone(&worker_tally), record, epoch, with_original)
            })
            .await;
        }

        let poll = Duration::from_millis(pool.interaction_poll_ms.max(1));
        for chunk in background.chunks(pool.background_chunk.max(1)) {
            if !explicit {
                inner.interaction.wait_idle(poll).await;
            }
            inner.pacer.pause(Priority::Idle).await;
            if inner.store.epoch() != epoch {
                debug!("Cache reset during background pass, stopping");
                report.cancelled = true;
                break;
            }
            let lanes = if inner.interaction.is_active() {
                pool.interacting_concurrency
            } else {
                pool.background_concurrency
            };
            let scheduler = Arc::clone(&inner.scheduler);
            let worker_tally = Arc::clone(&tally);
            ConcurrencyPool::run(chunk.to_vec(), lanes, move |record| {
                dispatch_record(Arc::clone(&scheduler), Arc::clone(&worker_tally), record, epoch, false)
            })
            .await;
        }

        report.loaded = tally.loaded.load(Ordering::Relaxed);
        report.failed = tally.failed.load(Ordering::Relaxed);
        debug!(
            visible = report.visible,
            background = report.background,
            loaded = report.loaded,
            failed = report.failed,
            "Load pass finished"
        );
        report
    }

    /// Appends the next page and starts resolving the new records.
    pub async fn load_more(&self, is_initial: bool) -> Result<Vec<ImageRecord>> {
        let appended = self.inner.window.load_more(is_initial).await?;
        self.spawn_pass(appended.clone());
        Ok(appended)
    }

    /// Streams the rest of the window, resolving each published batch.
    pub async fn load_all(&self) -> Result<LoadAllReport> {
        let engine = self.clone();
        self.inner
            .window
            .load_all(move |batch| engine.spawn_pass(batch.to_vec()))
            .await
    }

    pub fn cancel_load_all(&self) {
        self.inner.window.cancel_load_all();
    }

    /// Switches to big-page leaf `index` (1-based), dropping every cached handle.
    ///
    /// A rejected leaf leaves the cache alone. `None` means a later window
    /// change overtook the jump.
    pub async fn jump_to_window(&self, index: usize) -> Result<Option<Vec<ImageRecord>>> {
        let Some(records) = self.inner.window.jump_to_window(index).await? else {
            debug!(index, "Window jump superseded");
            return Ok(None);
        };
        self.inner.store.reset();
        self.spawn_pass(records.clone());
        Ok(Some(records))
    }

    /// Re-reads the displayed window.
    ///
    /// Handles of records that are still displayed survive unless `reset` is
    /// set; handles of records that disappeared are released.
    pub async fn refresh_preserve_cache(
        &self,
        reset: bool,
        opts: RefreshOptions,
    ) -> Result<Option<RefreshOutcome>> {
        if reset {
            self.inner.store.reset();
        }
        let Some(outcome) = self.inner.window.refresh(opts.preserve_length).await? else {
            debug!("Refresh superseded by another window change");
            return Ok(None);
        };
        if !outcome.removed.is_empty() {
            self.inner.store.remove(&outcome.removed);
        }
        self.spawn_pass(outcome.records.clone());
        Ok(Some(outcome))
    }

    // =========================================================================
    // Cache maintenance
    // =========================================================================

    pub fn remove_from_cache(&self, ids: &[ImageId]) -> usize {
        self.inner.store.remove(ids)
    }

    /// Re-resolves one handle from `path`, replacing whatever is cached.
    pub async fn recreate_handle(&self, id: &ImageId, path: impl Into<PathBuf>, is_thumbnail: bool) -> Dispatch {
        let kind = if is_thumbnail {
            ImageKind::Thumbnail
        } else {
            ImageKind::Original
        };
        let path = path.into();
        let mut record = self
            .inner
            .window
            .find(id)
            .unwrap_or_else(|| ImageRecord::new(id.clone(), path.clone()));
        match kind {
            ImageKind::Thumbnail => record.thumbnail_path = Some(path),
            ImageKind::Original => record.local_path = path,
        }
        let ticket = self.inner.store.restart(id, kind);
        self.inner.scheduler.run(&record, kind, ticket).await
    }

    /// Clears failed states of a displayed record and dispatches it again.
    pub async fn retry_failed(&self, id: &ImageId) -> Vec<(ImageKind, Dispatch)> {
        let cleared = self.inner.store.clear_failures(id);
        if cleared.is_empty() {
            return Vec::new();
        }
        let Some(record) = self.inner.window.find(id) else {
            debug!(%id, "Retry requested for a record outside the window");
            return Vec::new();
        };
        let mut outcomes = Vec::with_capacity(cleared.len());
        for kind in cleared {
            outcomes.push((kind, self.inner.scheduler.load(&record, kind).await));
        }
        outcomes
    }

    // =========================================================================
    // Read model
    // =========================================================================

    pub fn cache_map(&self) -> HashMap<ImageId, CacheEntry> {
        self.inner.store.snapshot()
    }

    pub fn entry(&self, id: &ImageId) -> Option<CacheEntry> {
        self.inner.store.get(id)
    }

    pub fn load_state(&self, id: &ImageId, kind: ImageKind) -> LoadState {
        self.inner.store.state(id, kind)
    }

    /// Fires whenever the cache map changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.store.subscribe()
    }

    // =========================================================================
    // Viewport and interaction
    // =========================================================================

    pub fn set_interacting(&self, active: bool) {
        self.inner.interaction.set(active);
    }

    pub fn interaction(&self) -> InteractionFlag {
        self.inner.interaction.clone()
    }

    /// Records the scroll container geometry. `columns: None` switches the
    /// estimate to the rendered cells set with `set_rendered`.
    pub fn update_viewport(&self, metrics: ViewportMetrics, columns: Option<usize>) {
        let mut viewport = self.inner.viewport.lock();
        viewport.metrics = Some(metrics);
        viewport.columns = columns;
    }

    pub fn set_rendered(&self, rendered: Vec<RenderedItem>) {
        self.inner.viewport.lock().rendered = rendered;
    }

    /// Estimate over the displayed window; empty until a viewport is known.
    pub fn viewport_estimate(&self) -> ViewportEstimate {
        let records = self.inner.window.displayed();
        let viewport = self.inner.viewport.lock();
        let Some(metrics) = viewport.metrics else {
            return ViewportEstimate::default();
        };
        let layout = match viewport.columns {
            Some(columns) => GridLayout::Columns(columns),
            None => GridLayout::Measured(&viewport.rendered),
        };
        self.inner.estimator.estimate(metrics, &records, layout)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Listens to `events`, replacing any earlier listener.
    pub fn attach_invalidation(&self, events: flume::Receiver<ChangeEvent>, filter: Option<EventFilter>) {
        let mut bridge = InvalidationBridge::new(Duration::from_millis(self.inner.config.invalidation.throttle_ms));
        if let Some(filter) = filter {
            bridge = bridge.with_filter(filter);
        }
        let handle = bridge.spawn(
            events,
            EngineSink {
                inner: Arc::downgrade(&self.inner),
            },
        );
        if let Some(previous) = self.inner.bridge.lock().replace(handle) {
            previous.stop();
        }
    }
}

/// Holds the engine weakly so the listener never keeps it alive.
struct EngineSink {
    inner: Weak<EngineInner>,
}

impl EngineSink {
    fn engine(&self) -> Option<GalleryEngine> {
        self.inner.upgrade().map(|inner| GalleryEngine { inner })
    }
}

#[async_trait]
impl InvalidationSink for EngineSink {
    async fn evict(&self, ids: Vec<ImageId>) {
        let Some(engine) = self.engine() else {
            return;
        };
        let set: HashSet<ImageId> = ids.iter().cloned().collect();
        let shown = engine.inner.window.remove_ids(&set);
        let cached = engine.inner.store.remove(&ids);
        debug!(shown, cached, "Evicted removed images");
    }

    async fn refresh(&self) {
        let Some(engine) = self.engine() else {
            return;
        };
        if let Err(e) = engine.refresh_preserve_cache(false, RefreshOptions::default()).await {
            warn!(error = ?e, "Refresh after change notification failed");
        }
    }
}
