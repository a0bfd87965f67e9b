use std::sync::Arc;

use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::cache::{Begin, CacheStore, Ticket};
use crate::config::RetryConfig;
use crate::error::{FailureKind, ResolveError};
use crate::models::{ImageKind, ImageRecord};
use crate::resolver::PathResolver;

/// How a dispatch of one (id, kind) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Loaded { attempts: u32 },
    Failed { attempts: u32, reason: FailureKind },
    /// Another dispatch owns the slot.
    Coalesced,
    AlreadyLoaded,
    /// The slot failed earlier and was not cleared.
    PreviouslyFailed,
    /// The record left scope while this dispatch ran; nothing was written.
    Stale,
}

/// Runs resolutions under the per-kind timeout and backoff policy.
///
/// Every state transition goes through the cache store with the dispatch
/// ticket, so a retry for a removed or reset record turns into a no-op.
pub struct RetryScheduler {
    resolver: Arc<PathResolver>,
    store: Arc<CacheStore>,
    policies: RetryConfig,
}

impl RetryScheduler {
    pub fn new(resolver: Arc<PathResolver>, store: Arc<CacheStore>, policies: RetryConfig) -> Self {
        Self {
            resolver,
            store,
            policies,
        }
    }

    pub fn policies(&self) -> &RetryConfig {
        &self.policies
    }

    /// Claims the slot and runs it, or reports why nothing ran.
    pub async fn load(&self, record: &ImageRecord, kind: ImageKind) -> Dispatch {
        let begin = self.store.begin(&record.id, kind);
        self.dispatch(record, kind, begin).await
    }

    /// Like `load`, but a no-op once the store has left `epoch`.
    pub async fn load_at(&self, record: &ImageRecord, kind: ImageKind, epoch: u64) -> Dispatch {
        let begin = self.store.begin_at(&record.id, kind, epoch);
        self.dispatch(record, kind, begin).await
    }

    async fn dispatch(&self, record: &ImageRecord, kind: ImageKind, begin: Begin) -> Dispatch {
        match begin {
            Begin::Started(ticket) => self.run(record, kind, ticket).await,
            Begin::Coalesced => {
                trace!(id = %record.id, %kind, "Coalesced with pending dispatch");
                Dispatch::Coalesced
            }
            Begin::AlreadyLoaded => Dispatch::AlreadyLoaded,
            Begin::Failed => Dispatch::PreviouslyFailed,
            Begin::Superseded => Dispatch::Stale,
        }
    }

    /// Drives an already claimed slot to `Loaded` or `Failed`.
    pub async fn run(&self, record: &ImageRecord, kind: ImageKind, ticket: Ticket) -> Dispatch {
        let id = &record.id;
        let policy = self.policies.for_kind(kind);
        let max_attempts = policy.max_attempts.max(1);
        // Backoff sleeps come out of the same budget, so the last attempt may run short.
        let deadline = Instant::now() + policy.worst_case();
        let mut attempt = 1;

        loop {
            if !self.store.mark_attempt(id, kind, ticket, attempt) {
                return Dispatch::Stale;
            }

            let budget = policy.timeout().min(deadline.saturating_duration_since(Instant::now()));
            let result = match timeout(budget, self.resolver.resolve(record, kind)).await {
                Ok(result) => result,
                Err(_) => Err(ResolveError::Timeout { kind, budget }),
            };

            let error = match result {
                Ok(handle) => {
                    return if self.store.commit(id, kind, ticket, handle) {
                        trace!(%id, %kind, attempt, "Loaded");
                        Dispatch::Loaded { attempts: attempt }
                    } else {
                        Dispatch::Stale
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                let reason = error.kind();
                warn!(%id, %kind, attempts = attempt, error = %error, "Giving up on image");
                return if self.store.mark_failed(id, kind, ticket, attempt, reason) {
                    Dispatch::Failed {
                        attempts: attempt,
                        reason,
                    }
                } else {
                    Dispatch::Stale
                };
            }

            let delay = policy.backoff(attempt).min(deadline.saturating_duration_since(Instant::now()));
            debug!(%id, %kind, attempt, ?delay, error = %error, "Attempt failed, backing off");
            if !self.store.mark_backoff(id, kind, ticket, attempt) {
                return Dispatch::Stale;
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
