//! Bounded lane pool.
//!
//! - `min(concurrency, items)` lanes pull from one FIFO queue until it drains
//! - Item failures are logged and counted; sibling lanes keep going
//! - A panicking worker loses only its lane

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub lanes: usize,
}

impl PoolReport {
    fn merge(&mut self, other: PoolReport) {
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

pub struct ConcurrencyPool;

impl ConcurrencyPool {
    /// Runs `worker` over `items` with at most `concurrency` in flight.
    ///
    /// Items are dispatched in order.
    pub async fn run<T, W, Fut>(items: Vec<T>, concurrency: usize, worker: W) -> PoolReport
    where
        T: Send + 'static,
        W: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if items.is_empty() {
            return PoolReport::default();
        }
        let lanes = concurrency.max(1).min(items.len());

        let (tx, rx) = async_channel::unbounded();
        for item in items {
            // The receiver is alive, so this cannot fail.
            let _ = tx.try_send(item);
        }
        tx.close();

        let worker = Arc::new(worker);
        let mut set = JoinSet::new();
        for lane in 0..lanes {
            let rx = rx.clone();
            let worker = Arc::clone(&worker);
            set.spawn(async move {
                let mut report = PoolReport::default();
                while let Ok(item) = rx.recv().await {
                    match worker(item).await {
                        Ok(()) => report.completed += 1,
                        Err(e) => {
                            warn!(lane, error = ?e, "Pool item failed");
                            report.failed += 1;
                        }
                    }
                }
                trace!(lane, "Pool lane drained");
                report
            });
        }

        let mut total = PoolReport {
            lanes,
            ..Default::default()
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => total.merge(report),
                Err(e) => {
                    error!(error = ?e, "Pool lane aborted");
                    total.failed += 1;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_input_spawns_nothing() {
        let report = ConcurrencyPool::run(Vec::<u32>::new(), 4, |_| async { Ok(()) }).await;
        assert_eq!(report, PoolReport::default());
    }

    #[tokio::test]
    async fn test_lane_count_is_bounded_by_items() {
        let report = ConcurrencyPool::run(vec![1, 2], 8, |_| async { Ok(()) }).await;
        assert_eq!(report.lanes, 2);
        assert_eq!(report.completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let report = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            ConcurrencyPool::run((0..20).collect(), 3, move |_: u32| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
        };
        assert_eq!(report.completed, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let report = {
            let seen = Arc::clone(&seen);
            ConcurrencyPool::run(vec![1, 2, 3, 4], 2, move |n: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(n);
                    if n == 2 {
                        anyhow::bail!("corrupt file");
                    }
                    Ok(())
                }
            })
            .await
        };
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_single_lane_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            ConcurrencyPool::run(vec!["a", "b", "c"], 1, move |s: &'static str| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(s);
                    Ok(())
                }
            })
            .await;
        }
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }
}
