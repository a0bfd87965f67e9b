//! Viewport-prioritized image handle resolution for virtualized galleries.
//!
//! The crate turns collection records into displayable handles. Records in
//! view resolve first, the rest trickle in at idle priority, and every owned
//! buffer is released exactly once.

pub mod cache;
pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod layout;
pub mod models;
pub mod resolver;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, GalleryEngine, LoadReport, RefreshOptions};
pub use models::{ImageId, ImageKind, ImageRecord};
