//! Handle cache for the image grid.
//!
//! This module provides:
//! - `Handle` / `ImageBuffer` - Displayable references and the buffers behind them
//! - `CacheStore` - Entries, retention set and per (id, kind) load states
//! - `BlobRegistry` - Publishes and revokes owned-buffer references

pub mod handle;
pub mod state;
pub mod store;

pub use handle::{BlobRegistry, CacheEntry, Handle, ImageBuffer, LocalBlobRegistry};
pub use state::{LoadState, Ticket};
pub use store::{Begin, CacheStore};
