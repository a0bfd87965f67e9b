//! Cooperative pacing primitives.
//!
//! Background work yields through a `Pacer` instead of talking to a frame
//! clock directly, so the pacing policy runs the same in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Give the host a full idle slice.
    Idle,
    /// Let other ready tasks run, then continue.
    Frame,
}

#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, priority: Priority);
}

/// Pacer backed by the tokio timer.
#[derive(Debug, Clone)]
pub struct TokioPacer {
    idle_slice: Duration,
}

impl TokioPacer {
    pub fn new(idle_slice: Duration) -> Self {
        Self { idle_slice }
    }
}

impl Default for TokioPacer {
    fn default() -> Self {
        Self::new(Duration::from_millis(16))
    }
}

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, priority: Priority) {
        match priority {
            Priority::Idle => tokio::time::sleep(self.idle_slice).await,
            Priority::Frame => tokio::task::yield_now().await,
        }
    }
}

/// Set while the user drag-scrolls or pans/zooms a preview.
#[derive(Debug, Clone, Default)]
pub struct InteractionFlag {
    active: Arc<AtomicBool>,
}

impl InteractionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Polls until the interaction ends.
    pub async fn wait_idle(&self, poll: Duration) {
        while self.is_active() {
            tokio::time::sleep(poll).await;
        }
    }
}

/// Cooperative cancellation flag checked at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    cancelled: Arc<AtomicBool>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_returns_after_interaction_ends() {
        let flag = InteractionFlag::new();
        flag.set(true);
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait_idle(Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());
        flag.set(false);
        waiter.await.unwrap();
    }

    #[test]
    fn test_abort_flag_is_shared() {
        let flag = AbortFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
