//! Change notifications to scoped refreshes.
//!
//! - Events arrive on a flume channel with at-least-once delivery
//! - A filter predicate drops events that do not concern the displayed window
//! - Removal events evict their ids immediately
//! - Refreshes are throttled on the trailing edge: a burst collapses into one
//!   refresh that runs one throttle interval after its first event

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::models::ImageId;

/// A "data may have changed" notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeEvent {
    pub reason: Option<String>,
    pub image_ids: Option<Vec<ImageId>>,
    pub task_id: Option<String>,
    pub album_id: Option<String>,
}

impl ChangeEvent {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, ids: Vec<ImageId>) -> Self {
        self.image_ids = Some(ids);
        self
    }

    /// Ids this event removes from the collection, if any.
    pub fn removed_ids(&self) -> Option<&[ImageId]> {
        let removal = matches!(self.reason.as_deref(), Some("remove") | Some("delete"));
        match &self.image_ids {
            Some(ids) if removal && !ids.is_empty() => Some(ids),
            _ => None,
        }
    }
}

pub type EventFilter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Accepts events that name `album_id` or no album at all.
pub fn album_filter(album_id: impl Into<String>) -> EventFilter {
    let album_id = album_id.into();
    Arc::new(move |event| event.album_id.as_deref().map_or(true, |a| a == album_id))
}

/// Accepts events that name `task_id` or no task at all.
pub fn task_filter(task_id: impl Into<String>) -> EventFilter {
    let task_id = task_id.into();
    Arc::new(move |event| event.task_id.as_deref().map_or(true, |t| t == task_id))
}

/// Where the bridge sends its work.
#[async_trait]
pub trait InvalidationSink: Send + Sync + 'static {
    async fn evict(&self, ids: Vec<ImageId>);
    async fn refresh(&self);
}

pub struct InvalidationBridge {
    throttle: Duration,
    filter: Option<EventFilter>,
}

impl InvalidationBridge {
    pub fn new(throttle: Duration) -> Self {
        Self { throttle, filter: None }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Spawns the listener. It runs until the channel closes or the handle stops it.
    pub fn spawn<S: InvalidationSink>(self, events: Receiver<ChangeEvent>, sink: S) -> BridgeHandle {
        let task = tokio::spawn(self.run(events, sink));
        BridgeHandle { task }
    }

    async fn run<S: InvalidationSink>(self, events: Receiver<ChangeEvent>, sink: S) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                received = events.recv_async() => {
                    let Ok(event) = received else {
                        // Senders are gone; flush the trailing refresh.
                        if deadline.is_some() {
                            sink.refresh().await;
                        }
                        debug!("Change stream closed");
                        break;
                    };
                    if let Some(filter) = &self.filter {
                        if !filter(&event) {
                            trace!(?event, "Ignoring unrelated change");
                            continue;
                        }
                    }
                    if let Some(ids) = event.removed_ids() {
                        debug!(count = ids.len(), "Evicting removed images");
                        sink.evict(ids.to_vec()).await;
                    }
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + self.throttle);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    trace!("Running throttled refresh");
                    sink.refresh().await;
                }
            }
        }
    }
}

pub struct BridgeHandle {
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops listening; a pending refresh is dropped.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the listener to exit after the channel closed.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
