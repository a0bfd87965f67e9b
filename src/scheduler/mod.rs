//! Dispatch machinery: retries, lane pools and cooperative pacing.

pub mod pacing;
pub mod pool;
pub mod retry;

pub use pacing::{AbortFlag, InteractionFlag, Pacer, Priority, TokioPacer};
pub use pool::{ConcurrencyPool, PoolReport};
pub use retry::{Dispatch, RetryScheduler};
